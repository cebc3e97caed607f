//! Capture filter expressions.
//!
//! A small BPF-like language evaluated against decoded [`PacketRecord`]s:
//! `ip`, `ip6`, `tcp`, `udp`, `icmp`, `[src|dst] host ADDR`,
//! `[src|dst] port N`, combined with `and`/`&&`, `or`/`||`, `not`/`!`
//! and parentheses. The empty expression matches every packet.

use std::net::IpAddr;

use crate::error::{DetectorError, Result};
use crate::packet::{PacketRecord, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Either,
    Src,
    Dst,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Any,
    Ipv4,
    Ipv6,
    Proto(Protocol),
    Host(Direction, IpAddr),
    Port(Direction, u16),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn matches(&self, packet: &PacketRecord) -> bool {
        match self {
            Expr::Any => true,
            Expr::Ipv4 => matches!(packet.src_ip, Some(IpAddr::V4(_))),
            Expr::Ipv6 => matches!(packet.src_ip, Some(IpAddr::V6(_))),
            Expr::Proto(proto) => packet.protocol == *proto,
            Expr::Host(dir, addr) => {
                let src = packet.src_ip == Some(*addr);
                let dst = packet.dst_ip == Some(*addr);
                match dir {
                    Direction::Either => src || dst,
                    Direction::Src => src,
                    Direction::Dst => dst,
                }
            }
            Expr::Port(dir, port) => {
                let src = packet.src_port == Some(*port);
                let dst = packet.dst_port == Some(*port);
                match dir {
                    Direction::Either => src || dst,
                    Direction::Src => src,
                    Direction::Dst => dst,
                }
            }
            Expr::Not(inner) => !inner.matches(packet),
            Expr::And(lhs, rhs) => lhs.matches(packet) && rhs.matches(packet),
            Expr::Or(lhs, rhs) => lhs.matches(packet) || rhs.matches(packet),
        }
    }
}

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFilter {
    source: String,
    expr: Expr,
}

impl CaptureFilter {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source);
        let expr = if tokens.is_empty() {
            Expr::Any
        } else {
            let mut parser = Parser { tokens: &tokens, pos: 0 };
            let expr = parser.parse_or()?;
            if let Some(tok) = parser.peek() {
                return Err(filter_error(source, &format!("unexpected token '{}'", tok)));
            }
            expr
        };

        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn match_all() -> Self {
        Self {
            source: String::new(),
            expr: Expr::Any,
        }
    }

    pub fn matches(&self, packet: &PacketRecord) -> bool {
        self.expr.matches(packet)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn filter_error(source: &str, reason: &str) -> DetectorError {
    DetectorError::Config(format!("invalid capture filter '{}': {}", source, reason))
}

fn tokenize(source: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '(' | ')' | '!' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(c.to_string());
            }
            '&' | '|' if chars.peek() == Some(&c) => {
                chars.next();
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(if c == '&' { "and".into() } else { "or".into() });
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

struct Parser<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Option<&'a str> {
        let tok = self.peek();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn source(&self) -> String {
        self.tokens.join(" ")
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some("or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some("and") {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some("not") | Some("!") => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some("(") => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.next() {
                    Some(")") => Ok(inner),
                    _ => Err(filter_error(&self.source(), "missing ')'")),
                }
            }
            _ => self.parse_primitive(),
        }
    }

    fn parse_primitive(&mut self) -> Result<Expr> {
        let source = self.source();
        let tok = self
            .next()
            .ok_or_else(|| filter_error(&source, "unexpected end of expression"))?;

        let direction = match tok {
            "ip" => return Ok(Expr::Ipv4),
            "ip6" => return Ok(Expr::Ipv6),
            "tcp" => return Ok(Expr::Proto(Protocol::Tcp)),
            "udp" => return Ok(Expr::Proto(Protocol::Udp)),
            "icmp" => return Ok(Expr::Proto(Protocol::Icmp)),
            "src" => Direction::Src,
            "dst" => Direction::Dst,
            "host" | "port" => {
                self.pos -= 1;
                Direction::Either
            }
            other => return Err(filter_error(&source, &format!("unknown primitive '{}'", other))),
        };

        let kind = self
            .next()
            .ok_or_else(|| filter_error(&source, "expected 'host' or 'port'"))?;
        let value = self
            .next()
            .ok_or_else(|| filter_error(&source, &format!("'{}' needs a value", kind)))?;

        match kind {
            "host" => {
                let addr: IpAddr = value
                    .parse()
                    .map_err(|_| filter_error(&source, &format!("bad address '{}'", value)))?;
                Ok(Expr::Host(direction, addr))
            }
            "port" => {
                let port: u16 = value
                    .parse()
                    .map_err(|_| filter_error(&source, &format!("bad port '{}'", value)))?;
                Ok(Expr::Port(direction, port))
            }
            other => Err(filter_error(
                &source,
                &format!("expected 'host' or 'port', got '{}'", other),
            )),
        }
    }
}
