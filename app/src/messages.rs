use std::sync::mpsc::{Receiver, Sender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipCommand {
    Call(String),
    Hangup,
    Register,
    Unregister,
    Quit,
}

impl SipCommand {
    /// Parses one console line. Empty or unknown input gives `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = match (words.next()?, words.next()) {
            ("call", Some(target)) => SipCommand::Call(target.to_string()),
            ("hangup", None) => SipCommand::Hangup,
            ("register", None) => SipCommand::Register,
            ("unregister", None) => SipCommand::Unregister,
            ("quit" | "exit", None) => SipCommand::Quit,
            _ => return None,
        };
        words.next().is_none().then_some(command)
    }
}

pub type SipCommandSender = Sender<SipCommand>;
pub type SipCommandReceiver = Receiver<SipCommand>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_lines() {
        assert_eq!(SipCommand::parse("call sip:bob@example.com"), Some(SipCommand::Call("sip:bob@example.com".into())));
        assert_eq!(SipCommand::parse("  hangup "), Some(SipCommand::Hangup));
        assert_eq!(SipCommand::parse("exit"), Some(SipCommand::Quit));
        assert_eq!(SipCommand::parse("call"), None);
        assert_eq!(SipCommand::parse("call a b"), None);
        assert_eq!(SipCommand::parse(""), None);
    }
}
