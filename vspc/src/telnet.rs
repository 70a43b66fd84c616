//! Telnet wire protocol: stream decoding and option negotiation.
//!
//! Decoding is streaming: [`TelnetParser`] walks the IAC framing and hands
//! back payload runs, option commands, and subnegotiation frames, however
//! the TCP layer happens to slice the stream. Negotiation follows the
//! RFC 1143 Q-method, so a confused or hostile peer can never drive an
//! option into an answer loop.
//!
//! [`Endpoint`] couples the two for one connection and is what the rest of
//! the crate uses: feed it raw bytes, get decoded events plus the response
//! bytes that must be written back to the peer.

// ── Telnet byte constants ──────────────────────────────────────────────────

/// Interpret As Command — the escape introducing all telnet framing.
pub const IAC: u8 = 255;
/// Opens a subnegotiation.
pub const SB: u8 = 250;
/// Closes a subnegotiation.
pub const SE: u8 = 240;
/// Sender intends to enable an option on its side.
pub const WILL: u8 = 251;
/// Sender declines to enable an option on its side.
pub const WONT: u8 = 252;
/// Sender asks the receiver to enable an option.
pub const DO: u8 = 253;
/// Sender asks the receiver to disable an option.
pub const DONT: u8 = 254;

/// Option numbers the concentrator negotiates on every connection.
pub mod opt {
    pub const BINARY: u8 = 0;
    pub const ECHO: u8 = 1;
    pub const SGA: u8 = 3;
}

// ── TelnetEvent ───────────────────────────────────────────────────────────

/// One decoded element of the telnet stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetEvent {
    /// A run of payload bytes, with framing and IAC escapes resolved.
    Data(Vec<u8>),
    /// `IAC WILL <opt>` from the peer.
    Will(u8),
    /// `IAC WONT <opt>` from the peer.
    Wont(u8),
    /// `IAC DO <opt>` from the peer.
    Do(u8),
    /// `IAC DONT <opt>` from the peer.
    Dont(u8),
    /// A whole `IAC SB <opt> … IAC SE` frame, body un-escaped.
    Subneg(u8, Vec<u8>),
    /// Framing the decoder could not make sense of (e.g. a stray command
    /// byte inside a subnegotiation). The decoder resynchronizes, but the
    /// peer is no longer trustworthy.
    Malformed,
}

// ── Parser ────────────────────────────────────────────────────────────────

/// Where the decoder currently is inside the framing.
#[derive(Debug, Clone, Copy)]
enum ParseState {
    /// Plain payload.
    Ground,
    /// An IAC has been consumed; the command byte is next.
    Command,
    /// WILL/WONT/DO/DONT (held here) wants its option byte.
    Option(u8),
    /// `IAC SB` consumed; the suboption code is next.
    SubOption,
    /// Collecting the body of a subnegotiation for this option.
    SubBody(u8),
    /// An IAC appeared inside a subnegotiation body.
    SubCommand(u8),
}

/// Streaming telnet decoder.
///
/// Only the in-flight framing state survives between calls, so input may
/// arrive in any chunking — per segment, per byte, or all at once. Payload
/// is passed through as whole runs rather than re-buffered byte by byte;
/// adjacent runs in one call coalesce into a single [`TelnetEvent::Data`].
#[derive(Debug)]
pub struct TelnetParser {
    state: ParseState,
    /// Body of the subnegotiation currently being collected.
    subneg: Vec<u8>,
}

impl Default for TelnetParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Ground,
            subneg: Vec::new(),
        }
    }

    /// Decode a chunk of raw input into events.
    pub fn feed(&mut self, input: &[u8]) -> Vec<TelnetEvent> {
        let mut events = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                ParseState::Ground => {
                    let rest = &input[pos..];
                    let run = rest.iter().position(|&b| b == IAC).unwrap_or(rest.len());
                    if run > 0 {
                        push_payload(&mut events, &rest[..run]);
                        pos += run;
                    } else {
                        self.state = ParseState::Command;
                        pos += 1;
                    }
                }
                ParseState::Command => {
                    let b = input[pos];
                    pos += 1;
                    self.state = match b {
                        IAC => {
                            // A doubled IAC is one literal 0xFF of payload.
                            push_payload(&mut events, &[IAC]);
                            ParseState::Ground
                        }
                        WILL | WONT | DO | DONT => ParseState::Option(b),
                        SB => ParseState::SubOption,
                        // NOP and the other bare commands carry no operand.
                        _ => ParseState::Ground,
                    };
                }
                ParseState::Option(cmd) => {
                    let o = input[pos];
                    pos += 1;
                    events.push(match cmd {
                        WILL => TelnetEvent::Will(o),
                        WONT => TelnetEvent::Wont(o),
                        DO => TelnetEvent::Do(o),
                        _ => TelnetEvent::Dont(o),
                    });
                    self.state = ParseState::Ground;
                }
                ParseState::SubOption => {
                    self.subneg.clear();
                    self.state = ParseState::SubBody(input[pos]);
                    pos += 1;
                }
                ParseState::SubBody(o) => {
                    let rest = &input[pos..];
                    let run = rest.iter().position(|&b| b == IAC).unwrap_or(rest.len());
                    self.subneg.extend_from_slice(&rest[..run]);
                    pos += run;
                    if run < rest.len() {
                        self.state = ParseState::SubCommand(o);
                        pos += 1;
                    }
                }
                ParseState::SubCommand(o) => {
                    let b = input[pos];
                    pos += 1;
                    match b {
                        SE => {
                            events.push(TelnetEvent::Subneg(
                                o,
                                std::mem::take(&mut self.subneg),
                            ));
                            self.state = ParseState::Ground;
                        }
                        IAC => {
                            // Escaped 0xFF inside the body.
                            self.subneg.push(IAC);
                            self.state = ParseState::SubBody(o);
                        }
                        _ => {
                            // Only SE or a doubled IAC may follow IAC here.
                            self.subneg.clear();
                            events.push(TelnetEvent::Malformed);
                            self.state = ParseState::Ground;
                        }
                    }
                }
            }
        }

        events
    }
}

/// Append a payload run, coalescing with an immediately preceding one.
fn push_payload(events: &mut Vec<TelnetEvent>, bytes: &[u8]) {
    if let Some(TelnetEvent::Data(tail)) = events.last_mut() {
        tail.extend_from_slice(bytes);
    } else {
        events.push(TelnetEvent::Data(bytes.to_vec()));
    }
}

// ── NegotiationState (RFC 1143 Q-method) ──────────────────────────────────

/// Per-option negotiation state for one side of the connection.
///
/// The two `Want` variants with `Opposite` carry the queued reversal bit
/// from RFC 1143 §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum QState {
    #[default]
    No,
    Yes,
    WantNo,
    WantNoOpposite,
    WantYes,
    WantYesOpposite,
}

impl QState {
    fn settled(self) -> bool {
        matches!(self, QState::No | QState::Yes)
    }
}

/// Tracks Telnet option negotiation for both sides of one connection.
///
/// `us` is the local side (peer speaks DO/DONT about it, we answer
/// WILL/WONT); `them` is the remote side (we speak DO/DONT, peer answers
/// WILL/WONT). The accept sets say which options we agree to when the peer
/// asks first; anything else is refused.
///
/// Call `receive_*` when the corresponding [`TelnetEvent`] arrives; each
/// returns `Some(bytes)` to write back when a response is required. A reply
/// that merely confirms one of our own pending requests generates no
/// counter-response, which is what breaks negotiation loops.
#[derive(Debug)]
pub struct NegotiationState {
    us: [QState; 256],
    them: [QState; 256],
    accept_us: [bool; 256],
    accept_them: [bool; 256],
}

impl NegotiationState {
    /// `accept_us` — options we are willing to enable locally when asked;
    /// `accept_them` — options we agree to the peer enabling.
    pub fn new(accept_us: &[u8], accept_them: &[u8]) -> Self {
        let mut s = Self {
            us: [QState::No; 256],
            them: [QState::No; 256],
            accept_us: [false; 256],
            accept_them: [false; 256],
        };
        for &o in accept_us {
            s.accept_us[o as usize] = true;
        }
        for &o in accept_them {
            s.accept_them[o as usize] = true;
        }
        s
    }

    /// Handle incoming `IAC WILL <opt>`.
    pub fn receive_will(&mut self, opt: u8) -> Option<Vec<u8>> {
        let i = opt as usize;
        match self.them[i] {
            QState::No => {
                if self.accept_them[i] {
                    self.them[i] = QState::Yes;
                    Some(vec![IAC, DO, opt])
                } else {
                    Some(vec![IAC, DONT, opt])
                }
            }
            QState::Yes => None,
            QState::WantNo => {
                // DONT answered by WILL — treat the option as off.
                self.them[i] = QState::No;
                None
            }
            QState::WantNoOpposite => {
                self.them[i] = QState::Yes;
                None
            }
            QState::WantYes => {
                self.them[i] = QState::Yes;
                None
            }
            QState::WantYesOpposite => {
                self.them[i] = QState::WantNo;
                Some(vec![IAC, DONT, opt])
            }
        }
    }

    /// Handle incoming `IAC WONT <opt>`.
    pub fn receive_wont(&mut self, opt: u8) -> Option<Vec<u8>> {
        let i = opt as usize;
        match self.them[i] {
            QState::No => None,
            QState::Yes => {
                self.them[i] = QState::No;
                Some(vec![IAC, DONT, opt])
            }
            QState::WantNo => {
                self.them[i] = QState::No;
                None
            }
            QState::WantNoOpposite => {
                self.them[i] = QState::WantYes;
                Some(vec![IAC, DO, opt])
            }
            QState::WantYes | QState::WantYesOpposite => {
                self.them[i] = QState::No;
                None
            }
        }
    }

    /// Handle incoming `IAC DO <opt>`.
    pub fn receive_do(&mut self, opt: u8) -> Option<Vec<u8>> {
        let i = opt as usize;
        match self.us[i] {
            QState::No => {
                if self.accept_us[i] {
                    self.us[i] = QState::Yes;
                    Some(vec![IAC, WILL, opt])
                } else {
                    Some(vec![IAC, WONT, opt])
                }
            }
            QState::Yes => None,
            QState::WantNo => {
                // WONT answered by DO — treat the option as off.
                self.us[i] = QState::No;
                None
            }
            QState::WantNoOpposite => {
                self.us[i] = QState::Yes;
                None
            }
            QState::WantYes => {
                self.us[i] = QState::Yes;
                None
            }
            QState::WantYesOpposite => {
                self.us[i] = QState::WantNo;
                Some(vec![IAC, WONT, opt])
            }
        }
    }

    /// Handle incoming `IAC DONT <opt>`.
    pub fn receive_dont(&mut self, opt: u8) -> Option<Vec<u8>> {
        let i = opt as usize;
        match self.us[i] {
            QState::No => None,
            QState::Yes => {
                self.us[i] = QState::No;
                Some(vec![IAC, WONT, opt])
            }
            QState::WantNo => {
                self.us[i] = QState::No;
                None
            }
            QState::WantNoOpposite => {
                self.us[i] = QState::WantYes;
                Some(vec![IAC, WILL, opt])
            }
            QState::WantYes | QState::WantYesOpposite => {
                self.us[i] = QState::No;
                None
            }
        }
    }

    /// Proactively offer a local option (`IAC WILL <opt>`).
    ///
    /// Returns `None` when the option is already enabled or in flight.
    pub fn request_will(&mut self, opt: u8) -> Option<Vec<u8>> {
        let i = opt as usize;
        match self.us[i] {
            QState::No => {
                self.us[i] = QState::WantYes;
                Some(vec![IAC, WILL, opt])
            }
            QState::WantNo => {
                self.us[i] = QState::WantNoOpposite;
                None
            }
            QState::WantYesOpposite => {
                self.us[i] = QState::WantYes;
                None
            }
            _ => None,
        }
    }

    /// Proactively request a remote option (`IAC DO <opt>`).
    pub fn request_do(&mut self, opt: u8) -> Option<Vec<u8>> {
        let i = opt as usize;
        match self.them[i] {
            QState::No => {
                self.them[i] = QState::WantYes;
                Some(vec![IAC, DO, opt])
            }
            QState::WantNo => {
                self.them[i] = QState::WantNoOpposite;
                None
            }
            QState::WantYesOpposite => {
                self.them[i] = QState::WantYes;
                None
            }
            _ => None,
        }
    }

    /// Whether *we* are currently active for `opt`.
    pub fn is_us(&self, opt: u8) -> bool {
        self.us[opt as usize] == QState::Yes
    }

    /// Whether *they* are currently active for `opt`.
    pub fn is_them(&self, opt: u8) -> bool {
        self.them[opt as usize] == QState::Yes
    }

    /// True once every option on both sides has reached a stable YES/NO.
    pub fn negotiation_done(&self) -> bool {
        self.us.iter().all(|q| q.settled()) && self.them.iter().all(|q| q.settled())
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────

/// A decoded event produced by [`Endpoint::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// Payload bytes with all Telnet framing stripped.
    Data(Vec<u8>),
    /// A complete subnegotiation frame for `opt`.
    Subneg(u8, Vec<u8>),
    /// The remote side of `opt` just transitioned to enabled.
    RemoteEnabled(u8),
    /// The peer sent framing we cannot parse; drop the connection.
    ProtocolViolation,
}

/// Parser + negotiation for one Telnet connection.
///
/// `offer` are the options we enable locally (announced with WILL by
/// [`Endpoint::start_negotiation`] and accepted when the peer sends DO);
/// `request` are the options we want the peer to enable (DO / accepted
/// WILL). A passive endpoint — one that lets the peer drive — simply never
/// calls `start_negotiation`.
#[derive(Debug)]
pub struct Endpoint {
    parser: TelnetParser,
    neg: NegotiationState,
    offer: Vec<u8>,
    request: Vec<u8>,
}

impl Endpoint {
    pub fn new(offer: &[u8], request: &[u8]) -> Self {
        Self {
            parser: TelnetParser::new(),
            neg: NegotiationState::new(offer, request),
            offer: offer.to_vec(),
            request: request.to_vec(),
        }
    }

    /// Bytes announcing every offered and requested option. Write these to
    /// the peer immediately after accepting the connection.
    pub fn start_negotiation(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for o in self.offer.clone() {
            if let Some(b) = self.neg.request_will(o) {
                out.extend_from_slice(&b);
            }
        }
        for o in self.request.clone() {
            if let Some(b) = self.neg.request_do(o) {
                out.extend_from_slice(&b);
            }
        }
        out
    }

    /// Process a raw chunk from the peer.
    ///
    /// Returns `(events, reply)`; the caller must write `reply` back to the
    /// peer (negotiation answers).
    pub fn process(&mut self, raw: &[u8]) -> (Vec<EndpointEvent>, Vec<u8>) {
        let mut events = Vec::new();
        let mut reply = Vec::new();

        for ev in self.parser.feed(raw) {
            match ev {
                TelnetEvent::Data(d) => events.push(EndpointEvent::Data(d)),
                TelnetEvent::Subneg(o, d) => events.push(EndpointEvent::Subneg(o, d)),
                TelnetEvent::Malformed => events.push(EndpointEvent::ProtocolViolation),
                TelnetEvent::Will(o) => {
                    let was = self.neg.is_them(o);
                    if let Some(b) = self.neg.receive_will(o) {
                        reply.extend_from_slice(&b);
                    }
                    if !was && self.neg.is_them(o) {
                        events.push(EndpointEvent::RemoteEnabled(o));
                    }
                }
                TelnetEvent::Wont(o) => {
                    if let Some(b) = self.neg.receive_wont(o) {
                        reply.extend_from_slice(&b);
                    }
                }
                TelnetEvent::Do(o) => {
                    if let Some(b) = self.neg.receive_do(o) {
                        reply.extend_from_slice(&b);
                    }
                }
                TelnetEvent::Dont(o) => {
                    if let Some(b) = self.neg.receive_dont(o) {
                        reply.extend_from_slice(&b);
                    }
                }
            }
        }

        (events, reply)
    }

    /// True once every option we negotiated has reached a stable YES/NO.
    pub fn negotiation_done(&self) -> bool {
        self.neg.negotiation_done()
    }

    pub fn is_us(&self, opt: u8) -> bool {
        self.neg.is_us(opt)
    }

    pub fn is_them(&self, opt: u8) -> bool {
        self.neg.is_them(opt)
    }
}

// ── Builders ──────────────────────────────────────────────────────────────

/// Double every literal `0xFF` in `data`, appending to `out`.
fn escape_into(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        if b == IAC {
            out.push(IAC);
        }
        out.push(b);
    }
}

/// Escape payload for transmission on a Telnet channel.
pub fn escape_iac(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    escape_into(&mut out, data);
    out
}

/// Frame `data` as `IAC SB <opt> … IAC SE`, escaping the body.
pub fn build_subneg(opt: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + data.len());
    buf.extend_from_slice(&[IAC, SB, opt]);
    escape_into(&mut buf, data);
    buf.extend_from_slice(&[IAC, SE]);
    buf
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Vec<TelnetEvent> {
        TelnetParser::new().feed(bytes)
    }

    // ── parser ────────────────────────────────────────────────────────────

    #[test]
    fn payload_passes_through_as_one_run() {
        assert_eq!(decode(b"hello"), vec![TelnetEvent::Data(b"hello".to_vec())]);
    }

    #[test]
    fn doubled_iac_is_a_literal_ff() {
        // The runs on either side of the escape coalesce with it.
        assert_eq!(
            decode(&[b'x', IAC, IAC, b'y']),
            vec![TelnetEvent::Data(vec![b'x', 0xFF, b'y'])]
        );
    }

    #[test]
    fn option_commands() {
        assert_eq!(
            decode(&[IAC, WILL, opt::ECHO]),
            vec![TelnetEvent::Will(opt::ECHO)]
        );
        assert_eq!(
            decode(&[IAC, WONT, opt::BINARY]),
            vec![TelnetEvent::Wont(opt::BINARY)]
        );
        assert_eq!(decode(&[IAC, DO, opt::SGA]), vec![TelnetEvent::Do(opt::SGA)]);
        assert_eq!(
            decode(&[IAC, DONT, opt::ECHO]),
            vec![TelnetEvent::Dont(opt::ECHO)]
        );
    }

    #[test]
    fn commands_split_payload_runs() {
        let mut wire = b"pi".to_vec();
        wire.extend_from_slice(&[IAC, WILL, opt::BINARY]);
        wire.extend_from_slice(b"ng");
        assert_eq!(
            decode(&wire),
            vec![
                TelnetEvent::Data(b"pi".to_vec()),
                TelnetEvent::Will(opt::BINARY),
                TelnetEvent::Data(b"ng".to_vec()),
            ]
        );
    }

    #[test]
    fn subneg_frame() {
        let mut bytes = vec![IAC, SB, 232, 80];
        bytes.extend_from_slice(b"abc-123");
        bytes.extend_from_slice(&[IAC, SE]);
        let events = decode(&bytes);
        assert_eq!(events, vec![TelnetEvent::Subneg(232, {
            let mut d = vec![80u8];
            d.extend_from_slice(b"abc-123");
            d
        })]);
    }

    #[test]
    fn subneg_body_unescapes_iac() {
        let bytes = [IAC, SB, opt::BINARY, 0x42, IAC, IAC, 0x43, IAC, SE];
        assert_eq!(
            decode(&bytes),
            vec![TelnetEvent::Subneg(opt::BINARY, vec![0x42, 0xFF, 0x43])]
        );
    }

    #[test]
    fn malformed_subneg_is_flagged() {
        // IAC inside SB followed by something that is neither SE nor IAC
        // drops the frame and reports the violation; the decoder itself
        // keeps going afterwards.
        let mut bytes = vec![IAC, SB, opt::BINARY, 1, 2, IAC, WILL];
        bytes.extend_from_slice(b"ok");
        assert_eq!(
            decode(&bytes),
            vec![TelnetEvent::Malformed, TelnetEvent::Data(b"ok".to_vec())]
        );
    }

    #[test]
    fn byte_at_a_time_equals_one_shot() {
        // Chunking must never change what is decoded. Data events may
        // fragment differently, so payload and control are compared
        // separately.
        fn split(events: Vec<TelnetEvent>) -> (Vec<u8>, Vec<TelnetEvent>) {
            let mut payload = Vec::new();
            let mut control = Vec::new();
            for ev in events {
                match ev {
                    TelnetEvent::Data(d) => payload.extend_from_slice(&d),
                    other => control.push(other),
                }
            }
            (payload, control)
        }

        let wire = [b'a', IAC, WILL, opt::SGA, IAC, SB, 232, 0, 1, IAC, SE, b'b'];
        let one_shot = TelnetParser::new().feed(&wire);

        let mut parser = TelnetParser::new();
        let mut trickled = Vec::new();
        for &b in &wire {
            trickled.extend(parser.feed(&[b]));
        }

        assert_eq!(split(one_shot), split(trickled));
    }

    // ── negotiation ───────────────────────────────────────────────────────

    fn server_neg() -> NegotiationState {
        NegotiationState::new(
            &[opt::BINARY, opt::SGA, opt::ECHO],
            &[opt::BINARY, opt::SGA],
        )
    }

    #[test]
    fn will_accepted_for_wanted_option() {
        let mut neg = server_neg();
        let resp = neg.receive_will(opt::BINARY);
        assert_eq!(resp, Some(vec![IAC, DO, opt::BINARY]));
        assert!(neg.is_them(opt::BINARY));
    }

    #[test]
    fn will_refused_for_unwanted_option() {
        let mut neg = server_neg();
        let resp = neg.receive_will(opt::ECHO); // we WILL echo, we don't DO it
        assert_eq!(resp, Some(vec![IAC, DONT, opt::ECHO]));
        assert!(!neg.is_them(opt::ECHO));
    }

    #[test]
    fn do_accepted_for_offered_option() {
        let mut neg = server_neg();
        let resp = neg.receive_do(opt::ECHO);
        assert_eq!(resp, Some(vec![IAC, WILL, opt::ECHO]));
        assert!(neg.is_us(opt::ECHO));
    }

    #[test]
    fn do_refused_for_unoffered_option() {
        let mut neg = server_neg();
        let resp = neg.receive_do(42);
        assert_eq!(resp, Some(vec![IAC, WONT, 42]));
        assert!(!neg.is_us(42));
    }

    #[test]
    fn confirmation_of_pending_request_is_silent() {
        // The loop-avoidance core of the Q-method: a WILL that answers our
        // own DO must not generate another DO.
        let mut neg = server_neg();
        assert_eq!(neg.request_do(opt::SGA), Some(vec![IAC, DO, opt::SGA]));
        assert_eq!(neg.receive_will(opt::SGA), None);
        assert!(neg.is_them(opt::SGA));

        assert_eq!(neg.request_will(opt::ECHO), Some(vec![IAC, WILL, opt::ECHO]));
        assert_eq!(neg.receive_do(opt::ECHO), None);
        assert!(neg.is_us(opt::ECHO));
    }

    #[test]
    fn refusal_of_pending_request_settles_to_no() {
        let mut neg = server_neg();
        neg.request_do(opt::BINARY);
        assert_eq!(neg.receive_wont(opt::BINARY), None);
        assert!(!neg.is_them(opt::BINARY));
        assert!(neg.negotiation_done());
    }

    #[test]
    fn duplicate_request_not_resent() {
        let mut neg = server_neg();
        assert!(neg.request_do(opt::BINARY).is_some());
        assert!(neg.request_do(opt::BINARY).is_none()); // already in flight
        neg.receive_will(opt::BINARY);
        assert!(neg.request_do(opt::BINARY).is_none()); // already enabled
    }

    #[test]
    fn dont_disables_active_option() {
        let mut neg = server_neg();
        neg.receive_do(opt::ECHO);
        assert_eq!(neg.receive_dont(opt::ECHO), Some(vec![IAC, WONT, opt::ECHO]));
        assert!(!neg.is_us(opt::ECHO));
    }

    #[test]
    fn negotiation_done_tracks_pending_requests() {
        let mut neg = server_neg();
        assert!(neg.negotiation_done()); // nothing requested yet
        neg.request_will(opt::ECHO);
        assert!(!neg.negotiation_done());
        neg.receive_do(opt::ECHO);
        assert!(neg.negotiation_done());
    }

    // ── endpoint ──────────────────────────────────────────────────────────

    #[test]
    fn endpoint_remote_enabled_fires_once() {
        let mut ep = Endpoint::new(&[opt::BINARY], &[opt::BINARY, 232]);
        let (events, reply) = ep.process(&[IAC, WILL, 232]);
        assert_eq!(events, vec![EndpointEvent::RemoteEnabled(232)]);
        assert_eq!(reply, vec![IAC, DO, 232]);

        // A duplicate WILL does not re-announce.
        let (events, reply) = ep.process(&[IAC, WILL, 232]);
        assert!(events.is_empty());
        assert!(reply.is_empty());
    }

    #[test]
    fn endpoint_full_handshake_settles() {
        // Drive two endpoints against each other until quiescent.
        let mut server = Endpoint::new(&[opt::BINARY, opt::SGA, opt::ECHO], &[opt::BINARY, opt::SGA]);
        let mut client = Endpoint::new(&[opt::BINARY, opt::SGA], &[opt::BINARY, opt::SGA, opt::ECHO]);

        let mut to_client = server.start_negotiation();
        let mut to_server = client.start_negotiation();
        for _ in 0..8 {
            if to_client.is_empty() && to_server.is_empty() {
                break;
            }
            let (_, r1) = client.process(&to_client);
            let (_, r2) = server.process(&to_server);
            to_server = r1;
            to_client = r2;
        }

        assert!(server.negotiation_done());
        assert!(client.negotiation_done());
        assert!(server.is_us(opt::ECHO));
        assert!(server.is_them(opt::BINARY));
        assert!(client.is_them(opt::ECHO));
    }

    #[test]
    fn endpoint_strips_options_from_payload() {
        let mut ep = Endpoint::new(&[opt::BINARY], &[opt::BINARY]);
        let mut input = b"pi".to_vec();
        input.extend_from_slice(&[IAC, WILL, opt::BINARY]);
        input.extend_from_slice(b"ng");
        let (events, _) = ep.process(&input);
        let data: Vec<u8> = events
            .into_iter()
            .filter_map(|e| match e {
                EndpointEvent::Data(d) => Some(d),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(data, b"ping");
    }

    // ── builders ──────────────────────────────────────────────────────────

    #[test]
    fn escape_iac_doubles_ff() {
        assert_eq!(escape_iac(&[1, IAC, 2]), vec![1, IAC, IAC, 2]);
        assert_eq!(escape_iac(b"plain"), b"plain".to_vec());
    }

    #[test]
    fn subneg_builder_escapes_its_body() {
        assert_eq!(
            build_subneg(opt::BINARY, &[0x42, 0xFF, 0x43]),
            vec![IAC, SB, opt::BINARY, 0x42, IAC, 0xFF, 0x43, IAC, SE]
        );
    }
}
