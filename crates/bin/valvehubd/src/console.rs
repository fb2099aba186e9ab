//! Line-oriented command intake.
//!
//! | Line | Request |
//! |------|---------|
//! | `open` | open for the default duration |
//! | `open <minutes>` | timed open |
//! | `close` | close |
//! | `scan on` / `scan off` | toggle background polling |
//! | `duration <minutes>` | set the default duration (`0` = untimed) |
//! | `status` | print the status snapshot |
//! | `discover` | scan for controllers |
//! | `help` | list commands |
//! | `quit` | exit |

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Open(Option<u32>),
    Close,
    Scan(bool),
    Duration(u32),
    Status,
    Discover,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),

    #[error("`{command}` expects {expected}")]
    BadArgument {
        command: &'static str,
        expected: &'static str,
    },
}

pub const HELP: &str = "commands: open [minutes] | close | scan on|off | duration <minutes> | status | discover | quit";

/// Parse one console line. Blank lines yield `None`.
///
/// # Errors
///
/// Returns [`ParseError`] for unknown commands or bad arguments.
pub fn parse(line: &str) -> Result<Option<Request>, ParseError> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let argument = words.next();
    if words.next().is_some() {
        return Err(ParseError::Unknown(line.trim().to_string()));
    }

    let request = match (command.to_ascii_lowercase().as_str(), argument) {
        ("open", None) => Request::Open(None),
        ("open", Some(minutes)) => Request::Open(Some(minutes_arg("open", minutes)?)),
        ("close", None) => Request::Close,
        ("scan", Some(flag)) => match flag.to_ascii_lowercase().as_str() {
            "on" => Request::Scan(true),
            "off" => Request::Scan(false),
            _ => {
                return Err(ParseError::BadArgument {
                    command: "scan",
                    expected: "on or off",
                });
            }
        },
        ("duration", Some(minutes)) => Request::Duration(minutes_arg("duration", minutes)?),
        ("status", None) => Request::Status,
        ("discover", None) => Request::Discover,
        ("help", None) => Request::Help,
        ("quit" | "exit", None) => Request::Quit,
        _ => return Err(ParseError::Unknown(line.trim().to_string())),
    };
    Ok(Some(request))
}

fn minutes_arg(command: &'static str, raw: &str) -> Result<u32, ParseError> {
    raw.parse().map_err(|_| ParseError::BadArgument {
        command,
        expected: "a number of minutes",
    })
}
