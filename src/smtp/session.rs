use smtp_proto::{EXT_8BIT_MIME, EXT_ENHANCED_STATUS_CODES, EXT_START_TLS, EhloResponse, Request};
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Where the session stands in the upgrade path. `Upgrading` lives in the
/// connection driver: it spans the TLS handshake, not a command exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Plain,
    Greeted,
    Encrypted,
}

pub enum SessionReply {
    /// Write `code message`, keep reading.
    Reply(u16, String),
    /// Write `code message`, close the connection.
    Closing(u16, String),
    /// Pre-rendered multiline response (EHLO capabilities).
    RawReply(Vec<u8>),
    /// Write `220 Ready to start TLS` and run the handshake.
    StartUpgrade,
    /// Forward the original line to the upstream MTA.
    Relay(Vec<u8>),
}

pub struct BrokerSession {
    hostname: String,
    require_tls: bool,
    state: SessionState,
    peer: SocketAddr,
}

impl BrokerSession {
    const RESPONSE_GREETING_FIRST: &'static str = "5.5.1 Say EHLO first";
    const RESPONSE_READY_TLS: &'static str = "Ready to start TLS";
    const RESPONSE_ALREADY_TLS: &'static str = "TLS already active";
    const RESPONSE_MUST_STARTTLS: &'static str = "Must issue a STARTTLS command first";
    const RESPONSE_BYE: &'static str = "2.0.0 Goodbye";
    const RESPONSE_OK: &'static str = "2.0.0 Ok";

    pub fn new(hostname: &str, require_tls: bool, peer: SocketAddr) -> Self {
        BrokerSession {
            hostname: hostname.to_string(),
            require_tls,
            state: SessionState::Plain,
            peer,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The TLS handshake completed; protocol state resets and the client
    /// must greet again.
    pub fn upgraded(&mut self) {
        self.state = SessionState::Encrypted;
    }

    pub fn ready_banner(&self) -> (u16, String) {
        (220, Self::RESPONSE_READY_TLS.to_string())
    }

    pub fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
        raw_line: &[u8],
    ) -> SessionReply {
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                debug!("failed to parse command from {}: {e}", self.peer);
                return SessionReply::Reply(500, format!("5.5.2 {e}"));
            }
        };

        trace!("received {request:?} from {} in {:?}", self.peer, self.state);

        match request {
            Request::Ehlo { host } | Request::Helo { host } => {
                debug!("greeting from {host} ({})", self.peer);
                if self.state != SessionState::Encrypted {
                    self.state = SessionState::Greeted;
                }
                SessionReply::RawReply(self.capabilities())
            }
            Request::StartTls => match self.state {
                SessionState::Plain => {
                    SessionReply::Reply(503, Self::RESPONSE_GREETING_FIRST.into())
                }
                SessionState::Greeted => SessionReply::StartUpgrade,
                SessionState::Encrypted => {
                    SessionReply::Reply(454, Self::RESPONSE_ALREADY_TLS.into())
                }
            },
            Request::Quit => SessionReply::Closing(221, Self::RESPONSE_BYE.into()),
            Request::Noop { .. } => SessionReply::Reply(250, Self::RESPONSE_OK.into()),
            _ if self.state == SessionState::Encrypted => {
                SessionReply::Relay(raw_line.to_vec())
            }
            _ if self.require_tls => {
                SessionReply::Reply(530, Self::RESPONSE_MUST_STARTTLS.into())
            }
            _ if self.state == SessionState::Plain => {
                SessionReply::Reply(503, Self::RESPONSE_GREETING_FIRST.into())
            }
            _ => SessionReply::Relay(raw_line.to_vec()),
        }
    }

    /// EHLO capabilities; STARTTLS is only advertised before the upgrade.
    fn capabilities(&self) -> Vec<u8> {
        let mut response = EhloResponse::new(self.hostname.as_str());
        response.capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME;
        if self.state != SessionState::Encrypted {
            response.capabilities |= EXT_START_TLS;
        }

        let mut buf = Vec::with_capacity(128);
        response.write(&mut buf).ok();
        buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn session(require_tls: bool) -> BrokerSession {
        BrokerSession::new(
            "mail.gateway.example",
            require_tls,
            "192.0.2.1:4242".parse().unwrap(),
        )
    }

    fn command(session: &mut BrokerSession, line: &[u8]) -> SessionReply {
        let request = Request::parse(&mut line.iter()).map(Request::into_owned);
        session.handle(request, line)
    }

    #[test]
    fn ehlo_greets_and_advertises_starttls() {
        let mut session = session(true);
        let reply = command(&mut session, b"EHLO client.example\r\n");

        assert_eq!(session.state(), SessionState::Greeted);
        let SessionReply::RawReply(buf) = reply else {
            panic!("expected capabilities");
        };
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("STARTTLS"), "{text}");
    }

    #[test]
    fn starttls_before_greeting_is_rejected() {
        let mut session = session(true);
        let reply = command(&mut session, b"STARTTLS\r\n");
        assert!(matches!(reply, SessionReply::Reply(503, _)));
        assert_eq!(session.state(), SessionState::Plain);
    }

    #[test]
    fn greeted_starttls_starts_the_upgrade() {
        let mut session = session(true);
        command(&mut session, b"EHLO client.example\r\n");
        let reply = command(&mut session, b"STARTTLS\r\n");
        assert!(matches!(reply, SessionReply::StartUpgrade));
        assert_eq!(session.ready_banner(), (220, "Ready to start TLS".into()));
    }

    #[test]
    fn second_starttls_is_refused_when_encrypted() {
        let mut session = session(true);
        command(&mut session, b"EHLO client.example\r\n");
        session.upgraded();

        let reply = command(&mut session, b"STARTTLS\r\n");
        let SessionReply::Reply(code, message) = reply else {
            panic!("expected plain reply");
        };
        assert_eq!(code, 454);
        assert_eq!(message, "TLS already active");
    }

    #[test]
    fn commands_require_starttls_under_tls_required_policy() {
        let mut session = session(true);
        command(&mut session, b"EHLO client.example\r\n");

        let reply = command(&mut session, b"MAIL FROM:<a@example.com>\r\n");
        let SessionReply::Reply(code, message) = reply else {
            panic!("expected plain reply");
        };
        assert_eq!(code, 530);
        assert_eq!(message, "Must issue a STARTTLS command first");
    }

    #[test]
    fn commands_relay_after_upgrade() {
        let mut session = session(true);
        command(&mut session, b"EHLO client.example\r\n");
        session.upgraded();

        let line = b"MAIL FROM:<a@example.com>\r\n";
        let reply = command(&mut session, line);
        let SessionReply::Relay(forwarded) = reply else {
            panic!("expected relay");
        };
        assert_eq!(forwarded, line);
    }

    #[test]
    fn ehlo_after_upgrade_drops_starttls_capability() {
        let mut session = session(true);
        command(&mut session, b"EHLO client.example\r\n");
        session.upgraded();

        let SessionReply::RawReply(buf) = command(&mut session, b"EHLO client.example\r\n") else {
            panic!("expected capabilities");
        };
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("STARTTLS"), "{text}");
        assert_eq!(session.state(), SessionState::Encrypted);
    }

    #[test]
    fn relaxed_policy_relays_without_tls_once_greeted() {
        let mut session = session(false);
        command(&mut session, b"EHLO client.example\r\n");
        let reply = command(&mut session, b"MAIL FROM:<a@example.com>\r\n");
        assert!(matches!(reply, SessionReply::Relay(_)));
    }

    #[test]
    fn quit_closes_politely() {
        let mut session = session(true);
        let reply = command(&mut session, b"QUIT\r\n");
        assert!(matches!(reply, SessionReply::Closing(221, _)));
    }
}
