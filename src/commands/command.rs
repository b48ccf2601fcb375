use std::fmt;
use std::str::FromStr;

const KEYWORD_CONSUMER: &str = "consumer";
const KEYWORD_ALL: &str = "all";
const KEYWORD_SET: &str = "set";
const KEYWORD_COUNT: &str = "count";

/// A control command, parsed from a line such as `consumer restart orders invoices` or
/// `consumer set count 5 all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub action: Action,
    pub target: Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Restart,
    Status,
    /// Change the desired number of subscribers.
    SetCount(u16),
}

/// Which consumers a command applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Names(Vec<String>),
}

impl Target {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Names(names) => names.iter().any(|n| n == name),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command group {0:?}, expected \"consumer\"")]
    MissingKeyword(String),
    #[error("no consumer given to {0:?}, use consumer names or \"all\"")]
    MissingArguments(String),
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("unknown set command {0:?}")]
    UnknownSetting(String),
    #[error("invalid subscribers count {0:?}")]
    InvalidCount(String),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        match words.next() {
            None => return Err(CommandError::Empty),
            Some(KEYWORD_CONSUMER) => {}
            Some(other) => return Err(CommandError::MissingKeyword(other.to_owned())),
        }
        let verb = words
            .next()
            .ok_or_else(|| CommandError::MissingArguments(KEYWORD_CONSUMER.to_owned()))?;
        let action = match verb {
            "start" => Action::Start,
            "stop" => Action::Stop,
            "restart" => Action::Restart,
            "status" => Action::Status,
            KEYWORD_SET => {
                match words.next() {
                    Some(KEYWORD_COUNT) => {}
                    Some(other) => return Err(CommandError::UnknownSetting(other.to_owned())),
                    None => return Err(CommandError::MissingArguments(verb.to_owned())),
                }
                let count = words
                    .next()
                    .ok_or_else(|| CommandError::MissingArguments(verb.to_owned()))?;
                let count = count
                    .parse()
                    .map_err(|_| CommandError::InvalidCount(count.to_owned()))?;
                Action::SetCount(count)
            }
            other => return Err(CommandError::UnknownAction(other.to_owned())),
        };

        let names: Vec<String> = words.map(str::to_owned).collect();
        let target = if names.is_empty() {
            return Err(CommandError::MissingArguments(verb.to_owned()));
        } else if names.iter().any(|name| name == KEYWORD_ALL) {
            Target::All
        } else {
            Target::Names(names)
        };
        Ok(Command { action, target })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{KEYWORD_CONSUMER} ")?;
        match self.action {
            Action::Start => write!(f, "start")?,
            Action::Stop => write!(f, "stop")?,
            Action::Restart => write!(f, "restart")?,
            Action::Status => write!(f, "status")?,
            Action::SetCount(count) => write!(f, "{KEYWORD_SET} {KEYWORD_COUNT} {count}")?,
        }
        match &self.target {
            Target::All => write!(f, " {KEYWORD_ALL}"),
            Target::Names(names) => write!(f, " {}", names.join(" ")),
        }
    }
}
