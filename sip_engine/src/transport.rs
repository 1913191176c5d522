/// Outbound half of a connection. Inbound frames are pushed into
/// [`crate::SipStack::receive`] by whoever owns the socket.
pub trait Transport {
    /// Writes one serialized message. Returns false if it could not be sent.
    fn send(&mut self, data: &str) -> bool;

    /// Reliable transports (TCP, TLS, WebSocket) disable retransmissions and
    /// zero the wait timers D, I, J and K.
    fn is_reliable(&self) -> bool;

    /// Transport token for the Via header, e.g. `UDP` or `WSS`.
    fn via_transport(&self) -> &str;
}

/// Transport that records every frame in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    sent: Vec<String>,
    failing: bool,
    reliable: bool,
}

impl MemoryTransport {
    /// Datagram-like transport with retransmissions enabled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reliable() -> Self {
        Self {
            reliable: true,
            ..Self::default()
        }
    }

    /// Makes every following `send` fail until reset.
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    pub fn last_sent(&self) -> Option<&str> {
        self.sent.last().map(String::as_str)
    }

    pub fn take_sent(&mut self) -> Vec<String> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, data: &str) -> bool {
        if self.failing {
            log::warn!("memory transport refusing frame");
            return false;
        }
        self.sent.push(data.to_string());
        true
    }

    fn is_reliable(&self) -> bool {
        self.reliable
    }

    fn via_transport(&self) -> &str {
        if self.reliable {
            "TCP"
        } else {
            "UDP"
        }
    }
}
