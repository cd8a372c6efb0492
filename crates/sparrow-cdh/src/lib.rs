pub mod doctor;
pub mod safety;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use sparrow_link::{PacketLink, Radio};

use crate::safety::CommandRateLimit;

/// `[link header:4][auth code:4][opcode:2]`, args after that.
pub const MIN_FRAME_LEN: usize = 10;

/// Bit in the last link-header byte requesting a chained follow-up.
pub const MULTI_MSG_FLAG: u8 = 0x08;

pub const OPCODE_NOOP: [u8; 2] = [0x8e, 0x62];
pub const OPCODE_HARD_RESET: [u8; 2] = [0xd4, 0x9f];
pub const OPCODE_SHUTDOWN: [u8; 2] = [0x12, 0x06];
pub const OPCODE_QUERY: [u8; 2] = [0x38, 0x93];
pub const OPCODE_EXEC: [u8; 2] = [0x96, 0xa2];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("frame too short: {0} bytes")]
    ShortFrame(usize),

    #[error("bad authorization code")]
    BadCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKey {
    PowerMode,
    BatteryVoltage,
    BootCount,
    Hardware,
}

/// Closed command set. Opcodes map statically onto these variants;
/// there is deliberately no path from uplinked bytes to anything
/// resembling code execution.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Noop,
    HardReset,
    /// Already token-validated by the parser.
    Shutdown,
    Query(QueryKey),
    /// Legacy remote-exec opcode: recognized so the ground gets a clear
    /// refusal instead of "invalid cmd", but never executed.
    Exec,
}

enum ParseError {
    UnknownOpcode([u8; 2]),
    BadArgs(&'static str),
}

/// Side effects a command may have on the rest of the satellite. The
/// scheduler's context implements this; the dispatcher itself touches
/// nothing but the radio.
pub trait CommandEffects {
    fn request_shutdown(&mut self);
    fn request_reset(&mut self);
    fn query(&mut self, key: QueryKey) -> String;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub auth_code: [u8; 4],
    /// Independent second factor required to arm shutdown.
    pub shutdown_token: [u8; 4],
    pub multi_msg_timeout_ms: u64,
    /// How many chained follow-ups one frame may pull in.
    pub max_chain: u8,
    pub dangerous_min_interval_s: u64,
}

pub struct Dispatcher {
    cfg: DispatcherConfig,
    limiter: CommandRateLimit,
}

impl Dispatcher {
    pub fn new(cfg: DispatcherConfig) -> Self {
        let limiter = CommandRateLimit::new(Duration::from_secs(cfg.dangerous_min_interval_s));
        Self { cfg, limiter }
    }

    /// Validate and execute one authenticated command frame. A bad auth
    /// code executes nothing and produces no reply an attacker could
    /// use to probe the code.
    pub fn handle<R: Radio>(
        &mut self,
        frame: &[u8],
        link: &mut PacketLink<R>,
        fx: &mut dyn CommandEffects,
    ) -> Result<(), AuthError> {
        let chain_budget = self.cfg.max_chain;
        self.handle_inner(frame, link, fx, chain_budget)
    }

    fn handle_inner<R: Radio>(
        &mut self,
        frame: &[u8],
        link: &mut PacketLink<R>,
        fx: &mut dyn CommandEffects,
        chain_budget: u8,
    ) -> Result<(), AuthError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(AuthError::ShortFrame(frame.len()));
        }
        if !ct_eq(&frame[4..8], &self.cfg.auth_code) {
            warn!("cdh: bad authorization code, dropping frame");
            return Err(AuthError::BadCode);
        }

        let multi = frame[3] & MULTI_MSG_FLAG != 0;
        let opcode = [frame[8], frame[9]];
        let args = &frame[10..];

        match self.parse(opcode, args) {
            Ok(cmd) => self.execute(cmd, link, fx),
            Err(ParseError::UnknownOpcode(op)) => {
                warn!("cdh: unknown opcode {}", hex::encode(op));
                let mut reply = b"invalid cmd ".to_vec();
                reply.extend_from_slice(&op);
                let _ = link.send_raw(&reply);
            }
            Err(ParseError::BadArgs(why)) => {
                warn!("cdh: bad command args: {}", why);
                let _ = link.send_raw(b"invalid args");
            }
        }

        if multi && chain_budget > 0 {
            info!("cdh: multi-message mode, listening for follow-up");
            let timeout = Duration::from_millis(self.cfg.multi_msg_timeout_ms);
            match link.receive_raw(timeout) {
                Ok(Some(next)) => return self.handle_inner(&next, link, fx, chain_budget - 1),
                Ok(None) => debug!("cdh: no follow-up arrived"),
                Err(e) => warn!("cdh: follow-up receive failed: {}", e),
            }
        }
        Ok(())
    }

    fn parse(&self, opcode: [u8; 2], args: &[u8]) -> Result<Command, ParseError> {
        match opcode {
            OPCODE_NOOP => Ok(Command::Noop),
            OPCODE_HARD_RESET => Ok(Command::HardReset),
            OPCODE_SHUTDOWN => {
                // Shutdown arms only with its own second token.
                if args.len() == 4 && ct_eq(args, &self.cfg.shutdown_token) {
                    Ok(Command::Shutdown)
                } else {
                    Err(ParseError::BadArgs("shutdown token mismatch"))
                }
            }
            OPCODE_QUERY => match args.first() {
                Some(0x00) => Ok(Command::Query(QueryKey::PowerMode)),
                Some(0x01) => Ok(Command::Query(QueryKey::BatteryVoltage)),
                Some(0x02) => Ok(Command::Query(QueryKey::BootCount)),
                Some(0x03) => Ok(Command::Query(QueryKey::Hardware)),
                _ => Err(ParseError::BadArgs("unknown query key")),
            },
            OPCODE_EXEC => Ok(Command::Exec),
            op => Err(ParseError::UnknownOpcode(op)),
        }
    }

    fn execute<R: Radio>(
        &mut self,
        cmd: Command,
        link: &mut PacketLink<R>,
        fx: &mut dyn CommandEffects,
    ) {
        match cmd {
            Command::Noop => debug!("cdh: no-op"),
            Command::HardReset => {
                if !self.limiter.allow_reset() {
                    warn!("cdh: hard reset rate-limited");
                    return;
                }
                info!("cdh: hard reset commanded");
                let _ = link.send_raw(b"resetting");
                fx.request_reset();
            }
            Command::Shutdown => {
                if !self.limiter.allow_shutdown() {
                    warn!("cdh: shutdown rate-limited");
                    return;
                }
                info!("cdh: valid shutdown command received");
                let _ = link.send_raw(b"shutdown armed");
                fx.request_shutdown();
            }
            Command::Query(key) => {
                let answer = fx.query(key);
                let _ = link.send_raw(answer.as_bytes());
            }
            Command::Exec => {
                warn!("cdh: remote exec requested and refused");
                let _ = link.send_raw(b"exec disabled");
            }
        }
    }
}

/// Constant-time equality: the comparison touches every byte no matter
/// where the first mismatch is, so response timing leaks nothing about
/// the secret.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
