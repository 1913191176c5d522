use std::io::BufRead;

use crate::messages::{SipCommand, SipCommandSender};
use crate::tasks::task::{AppTask, TaskMeta};

/// Reads commands from stdin and forwards them to the SIP task.
pub struct ConsoleTask {
    sip_tx: SipCommandSender,
}

impl ConsoleTask {
    pub fn new(sip_tx: SipCommandSender) -> Self {
        Self { sip_tx }
    }

    fn run(self) {
        log::info!("commands: call <uri> | hangup | register | unregister | quit");
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("stdin error: {:?}", e);
                    break;
                }
            };
            let Some(command) = SipCommand::parse(&line) else {
                if !line.trim().is_empty() {
                    log::warn!("unknown command: {}", line.trim());
                }
                continue;
            };
            let quit = command == SipCommand::Quit;
            if self.sip_tx.send(command).is_err() || quit {
                return;
            }
        }
        // stdin closed
        let _ = self.sip_tx.send(SipCommand::Quit);
    }
}

impl AppTask for ConsoleTask {
    fn meta(&self) -> TaskMeta {
        TaskMeta {
            name: "console",
            stack_bytes: None,
        }
    }

    fn into_runner(self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static> {
        Box::new(move || (*self).run())
    }
}
