//! Parses the `DLB_ARGS`-style `--key=value` option string (§6) into
//! [`DlbOptions`]. Unlike a CLI's argv, this is a single environment-variable
//! string, so it's parsed by hand rather than with an argv-oriented parser.

use std::fmt;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HelperMode {
    Polling,
    Async,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MpiCalls {
    All,
    Barrier,
    Collectives,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Priority {
    Any,
    NearbyFirst,
    NearbyOnly,
    SpreadIfempty,
}

#[derive(Clone, Debug)]
pub struct DlbOptions {
    pub lewi: bool,
    pub mode: HelperMode,
    pub lewi_mpi_calls: MpiCalls,
    pub lewi_keep_cpu_on_blocking: bool,
    pub lewi_greedy: bool,
    pub lewi_warmup: bool,
    pub priority: Priority,
    pub shm_key: String,
    pub verbose: Vec<String>,
    pub verbose_format: Vec<String>,
}

impl Default for DlbOptions {
    fn default() -> Self {
        Self {
            lewi: true,
            mode: HelperMode::Polling,
            lewi_mpi_calls: MpiCalls::Barrier,
            lewi_keep_cpu_on_blocking: true,
            lewi_greedy: false,
            lewi_warmup: false,
            priority: Priority::Any,
            shm_key: String::new(),
            verbose: Vec::new(),
            verbose_format: Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OptionsParseError<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

impl fmt::Display for OptionsParseError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value {:?} for option --{}",
            self.value, self.key
        )
    }
}

impl std::error::Error for OptionsParseError<'_> {}

impl DlbOptions {
    /// Parses a whitespace-separated `--key=value` string, applying
    /// recognized keys on top of the defaults. Unrecognized keys are logged
    /// and ignored, matching the original tool's tolerance of
    /// forward-compatible options it doesn't understand.
    pub fn parse(args: &str) -> Result<Self, OptionsParseError<'_>> {
        let mut opts = Self::default();
        for token in args.split_whitespace() {
            let token = token.trim_start_matches("--");
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, v),
                None => (token, "yes"),
            };
            match key {
                "lewi" => opts.lewi = parse_bool(key, value)?,
                "mode" => {
                    opts.mode = match value {
                        "polling" => HelperMode::Polling,
                        "async" => HelperMode::Async,
                        _ => return Err(OptionsParseError { key, value }),
                    }
                }
                "lewi-mpi-calls" => {
                    opts.lewi_mpi_calls = match value {
                        "all" => MpiCalls::All,
                        "barrier" => MpiCalls::Barrier,
                        "collectives" => MpiCalls::Collectives,
                        _ => return Err(OptionsParseError { key, value }),
                    }
                }
                "lewi-keep-cpu-on-blocking" => {
                    opts.lewi_keep_cpu_on_blocking = parse_bool(key, value)?
                }
                "lewi-greedy" => opts.lewi_greedy = parse_bool(key, value)?,
                "lewi-warmup" => opts.lewi_warmup = parse_bool(key, value)?,
                "priority" => {
                    opts.priority = match value {
                        "any" => Priority::Any,
                        "nearby-first" => Priority::NearbyFirst,
                        "nearby-only" => Priority::NearbyOnly,
                        "spread-ifempty" => Priority::SpreadIfempty,
                        _ => return Err(OptionsParseError { key, value }),
                    }
                }
                "shm-key" => opts.shm_key = value.to_string(),
                "verbose" => opts.verbose = value.split(':').map(str::to_string).collect(),
                "verbose-format" => {
                    opts.verbose_format = value.split(':').map(str::to_string).collect()
                }
                "" => {}
                _ => log::warn!("ignoring unrecognized DLB option --{key}"),
            }
        }
        Ok(opts)
    }
}

fn parse_bool<'a>(key: &'a str, value: &'a str) -> Result<bool, OptionsParseError<'a>> {
    match value {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(OptionsParseError { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = DlbOptions::default();
        assert!(opts.lewi);
        assert_eq!(opts.mode, HelperMode::Polling);
    }

    #[test]
    fn parses_recognized_keys() {
        let opts = DlbOptions::parse("--lewi=yes --mode=async --priority=nearby-first --shm-key=foo")
            .unwrap();
        assert!(opts.lewi);
        assert_eq!(opts.mode, HelperMode::Async);
        assert_eq!(opts.priority, Priority::NearbyFirst);
        assert_eq!(opts.shm_key, "foo");
    }

    #[test]
    fn bare_flag_defaults_to_yes() {
        let opts = DlbOptions::parse("--lewi-greedy").unwrap();
        assert!(opts.lewi_greedy);
    }

    #[test]
    fn unrecognized_key_is_ignored_not_fatal() {
        assert!(DlbOptions::parse("--some-future-flag=3").is_ok());
    }

    #[test]
    fn bad_bool_value_is_an_error() {
        assert!(DlbOptions::parse("--lewi=maybe").is_err());
    }
}
