use crate::session::{MAX_DIALS_LIMIT, MAX_SESSIONS_LIMIT};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Default cap on concurrent sessions (`-max_clients`).
pub const DEFAULT_MAX_SESSIONS: usize = 32;
/// Default cap on concurrent in-progress dials (`-max_cip`).
pub const DEFAULT_MAX_DIALS: usize = 10;

/// Where one side of the relay attaches.
///
/// Built by the argument parser, consumed once by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Standard input / standard output.
    Stdio,
    /// Dial a remote host and port.
    Dial { host: String, port: u16 },
    /// Bind one or more local ports, on all interfaces when `host` is None.
    Listen { host: Option<IpAddr>, ports: Vec<u16> },
}

impl Endpoint {
    pub fn is_listen(&self) -> bool {
        matches!(self, Self::Listen { .. })
    }
}

/// An argument error. The binaries print it followed by their usage text
/// and exit 1.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct UsageError(String);

impl UsageError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Parsed tcpcat command line.
#[derive(Debug)]
pub struct CatOptions {
    pub first: Endpoint,
    pub second: Endpoint,
}

/// Parsed tcppipe command line.
#[derive(Debug)]
pub struct PipeOptions {
    pub max_sessions: usize,
    pub max_dials: usize,
    /// `-max_iotime` in whole seconds; None is unbounded.
    pub io_timeout: Option<Duration>,
    pub first: Endpoint,
    pub second: Endpoint,
}

/// `tcpcat <first_spec> <second_spec>`
pub fn parse_cat<I>(args: I) -> Result<CatOptions, UsageError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let first = next_endpoint(&mut args)?;
    let second = next_endpoint(&mut args)?;
    reject_trailing(&mut args)?;
    Ok(CatOptions { first, second })
}

/// `tcppipe [-max_clients N] [-max_cip N] [-max_iotime SECONDS] <first_spec> <second_spec>`
pub fn parse_pipe<I>(args: I) -> Result<PipeOptions, UsageError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut max_sessions = DEFAULT_MAX_SESSIONS;
    let mut max_dials = DEFAULT_MAX_DIALS;
    let mut io_timeout = None;

    let first = loop {
        let option = args
            .next()
            .ok_or_else(|| UsageError::new("missing endpoint specifier"))?;
        match option.as_str() {
            "-max_clients" => {
                max_sessions = bounded_count(&mut args, "-max_clients", MAX_SESSIONS_LIMIT)?;
            }
            "-max_cip" => {
                max_dials = bounded_count(&mut args, "-max_cip", MAX_DIALS_LIMIT)?;
            }
            "-max_iotime" => {
                let seconds = flag_value(&mut args, "-max_iotime")?;
                let seconds = parse_counting(&seconds)?;
                io_timeout = if seconds == 0 {
                    None
                } else {
                    Some(Duration::from_secs(seconds as u64))
                };
            }
            _ => break endpoint_group(&option, &mut args)?,
        }
    };
    let second = next_endpoint(&mut args)?;
    reject_trailing(&mut args)?;

    Ok(PipeOptions {
        max_sessions,
        max_dials,
        io_timeout,
        first,
        second,
    })
}

pub fn cat_usage() -> &'static str {
    "Usage: tcpcat <first_spec> <second_spec>\n\
     Each of <first_spec> and <second_spec> can be one of\n\
     \x20   -stdio\n\
     \x20   -listen <port_number>\n\
     \x20   -listen <address>:<port_number>\n\
     \x20   -connect <hostname>:<port_number>"
}

pub fn pipe_usage() -> &'static str {
    "Usage: tcppipe [-max_clients <n>] [-max_cip <n>] [-max_iotime <seconds>] \
     <first_spec> <second_spec>\n\
     Each of <first_spec> and <second_spec> can be one of\n\
     \x20   -stdio\n\
     \x20   -listen <port>[,<port>...]\n\
     \x20   -listen <address>:<port>[,<port>...]\n\
     \x20   -connect <hostname>:<port_number>"
}

fn next_endpoint<I>(args: &mut I) -> Result<Endpoint, UsageError>
where
    I: Iterator<Item = String>,
{
    let option = args
        .next()
        .ok_or_else(|| UsageError::new("missing endpoint specifier"))?;
    endpoint_group(&option, args)
}

/// One endpoint group: the option token plus its value token, if any.
fn endpoint_group<I>(option: &str, args: &mut I) -> Result<Endpoint, UsageError>
where
    I: Iterator<Item = String>,
{
    match option {
        "-stdio" => Ok(Endpoint::Stdio),
        "-listen" => {
            let spec = flag_value(args, "-listen")?;
            parse_listen_spec(&spec)
        }
        "-connect" => {
            let spec = flag_value(args, "-connect")?;
            parse_connect_spec(&spec)
        }
        other => Err(UsageError::new(format!("unknown option \"{other}\""))),
    }
}

/// `<port>[,<port>...]` or `<address>:<port>[,<port>...]`.
fn parse_listen_spec(spec: &str) -> Result<Endpoint, UsageError> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (host, port_list) = match parts.as_slice() {
        [ports] => (None, *ports),
        [host, ports] => {
            let addr: IpAddr = host
                .parse()
                .map_err(|_| UsageError::new(format!("invalid listen address \"{host}\"")))?;
            (Some(addr), *ports)
        }
        _ => return Err(UsageError::new(format!("invalid listen spec \"{spec}\""))),
    };

    let mut ports = Vec::new();
    for entry in port_list.split(',') {
        ports.push(parse_port(entry)?);
    }
    if ports.is_empty() {
        return Err(UsageError::new(format!("invalid listen spec \"{spec}\"")));
    }
    Ok(Endpoint::Listen { host, ports })
}

/// `<hostname>:<port>`.
fn parse_connect_spec(spec: &str) -> Result<Endpoint, UsageError> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [host, port] if !host.is_empty() => Ok(Endpoint::Dial {
            host: (*host).to_owned(),
            port: parse_port(port)?,
        }),
        _ => Err(UsageError::new(format!("invalid connect spec \"{spec}\""))),
    }
}

fn flag_value<I>(args: &mut I, flag: &str) -> Result<String, UsageError>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| UsageError::new(format!("{flag} requires a value")))
}

fn bounded_count<I>(args: &mut I, flag: &str, ceiling: usize) -> Result<usize, UsageError>
where
    I: Iterator<Item = String>,
{
    let value = flag_value(args, flag)?;
    let count = parse_counting(&value)? as usize;
    if count == 0 || count > ceiling {
        return Err(UsageError::new(format!(
            "{flag} must be between 1 and {ceiling}"
        )));
    }
    Ok(count)
}

/// Strict counting-number parse: digits only, no sign, bounded.
fn parse_counting(input: &str) -> Result<u32, UsageError> {
    if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(UsageError::new(format!(
            "invalid integer expression \"{input}\""
        )));
    }
    input
        .parse::<u32>()
        .map_err(|_| UsageError::new(format!("out-of-range integer expression \"{input}\"")))
}

fn parse_port(input: &str) -> Result<u16, UsageError> {
    let value = parse_counting(input)?;
    if value == 0 || value > u32::from(u16::MAX) {
        return Err(UsageError::new(format!("invalid port number \"{input}\"")));
    }
    Ok(value as u16)
}

fn reject_trailing<I>(args: &mut I) -> Result<(), UsageError>
where
    I: Iterator<Item = String>,
{
    match args.next() {
        Some(extra) => Err(UsageError::new(format!(
            "unexpected trailing argument \"{extra}\""
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn cat_stdio_to_connect() {
        let opts = parse_cat(argv(&["-stdio", "-connect", "example.org:9001"])).unwrap();
        assert_eq!(opts.first, Endpoint::Stdio);
        assert_eq!(
            opts.second,
            Endpoint::Dial {
                host: "example.org".to_owned(),
                port: 9001
            }
        );
    }

    #[test]
    fn listen_with_host_and_port_list() {
        let opts = parse_cat(argv(&["-listen", "127.0.0.1:7001,7002", "-stdio"])).unwrap();
        assert_eq!(
            opts.first,
            Endpoint::Listen {
                host: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                ports: vec![7001, 7002]
            }
        );
    }

    #[test]
    fn listen_all_interfaces() {
        let opts = parse_cat(argv(&["-listen", "5000", "-stdio"])).unwrap();
        assert_eq!(
            opts.first,
            Endpoint::Listen {
                host: None,
                ports: vec![5000]
            }
        );
    }

    #[test]
    fn pipe_flags_before_endpoints() {
        let opts = parse_pipe(argv(&[
            "-max_clients",
            "2",
            "-max_iotime",
            "7",
            "-listen",
            "7001",
            "-connect",
            "localhost:80",
        ]))
        .unwrap();
        assert_eq!(opts.max_sessions, 2);
        assert_eq!(opts.max_dials, DEFAULT_MAX_DIALS);
        assert_eq!(opts.io_timeout, Some(Duration::from_secs(7)));
        assert!(opts.first.is_listen());
    }

    #[test]
    fn pipe_defaults() {
        let opts = parse_pipe(argv(&["-stdio", "-connect", "h:1"])).unwrap();
        assert_eq!(opts.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(opts.max_dials, DEFAULT_MAX_DIALS);
        assert_eq!(opts.io_timeout, None);
    }

    #[test]
    fn rejects_cap_above_ceiling() {
        let err = parse_pipe(argv(&[
            "-max_clients",
            "100000",
            "-stdio",
            "-connect",
            "h:1",
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("-max_clients"));
    }

    #[test]
    fn rejects_negative_and_garbage_numbers() {
        assert!(parse_cat(argv(&["-listen", "-5", "-stdio"])).is_err());
        assert!(parse_cat(argv(&["-listen", "50x0", "-stdio"])).is_err());
        assert!(parse_cat(argv(&["-listen", "0", "-stdio"])).is_err());
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(parse_cat(argv(&["-stdio"])).is_err());
        assert!(parse_cat(argv(&["-stdio", "-stdio", "extra"])).is_err());
        assert!(parse_cat(argv(&["-connect", "nocolon", "-stdio"])).is_err());
        assert!(parse_cat(argv(&["-connect", ":80", "-stdio"])).is_err());
        assert!(parse_cat(argv(&["-listen", "a:b:c", "-stdio"])).is_err());
        assert!(parse_cat(argv(&["-bogus", "-stdio"])).is_err());
    }
}
