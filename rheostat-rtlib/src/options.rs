// Copyright 2025 Rheostat Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tuning flags parsed from a colon-separated environment string, e.g.
//! `RHEOSTAT_RTLIB_OPTS="Ds30:G:p1"`. Unknown flags are skipped with a
//! warning. Performance-counter and OpenCL flags are retained for
//! inspection but not acted upon.

use tracing::warn;

pub const OPTIONS_ENV: &str = "RHEOSTAT_RTLIB_OPTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationLimit {
    Seconds(u64),
    Cycles(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterScope {
    Global,
    #[default]
    PerExc,
    Overheads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsOutput {
    pub csv: bool,
    pub file: bool,
    pub summary: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtLibOptions {
    /// Stop the execution context after this many cycles or seconds.
    pub duration: Option<DurationLimit>,
    pub counter_scope: CounterScope,
    /// Run without a resource manager, forcing the given working mode.
    pub unmanaged_awm: Option<u8>,
    pub perf_verbosity: Option<u8>,
    /// Raw performance counters: verbosity level plus the raw event
    /// codes, verbatim.
    pub raw_counters: Option<(u8, String)>,
    pub stats_output: StatsOutput,
    /// Control-group override string, verbatim.
    pub cgroup_override: Option<String>,
    pub opencl_profiling: Option<u8>,
}

impl RtLibOptions {
    pub fn from_env() -> Self {
        match std::env::var(OPTIONS_ENV) {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        let mut options = Self::default();
        for token in raw.split(':').filter(|token| !token.is_empty()) {
            options.parse_token(token);
        }
        options
    }

    fn parse_token(&mut self, token: &str) {
        let mut chars = token.chars();
        let flag = chars.next().unwrap();
        let rest = chars.as_str();
        match flag {
            'D' => {
                let mut rest_chars = rest.chars();
                let unit = rest_chars.next();
                let number = rest_chars.as_str().parse::<u64>().ok();
                self.duration = match (unit, number) {
                    (Some('s'), Some(n)) => Some(DurationLimit::Seconds(n)),
                    (Some('c'), Some(n)) => Some(DurationLimit::Cycles(n)),
                    _ => {
                        warn!(token, "malformed duration limit, ignored");
                        self.duration
                    }
                };
            }
            'G' if rest.is_empty() => self.counter_scope = CounterScope::Global,
            'K' if rest.is_empty() => self.counter_scope = CounterScope::PerExc,
            'O' if rest.is_empty() => self.counter_scope = CounterScope::Overheads,
            'U' => match rest.parse::<u8>() {
                Ok(awm) => self.unmanaged_awm = Some(awm),
                Err(_) => warn!(token, "malformed unmanaged working mode, ignored"),
            },
            'p' => match rest.parse::<u8>() {
                Ok(level) => self.perf_verbosity = Some(level),
                Err(_) => warn!(token, "malformed counter verbosity, ignored"),
            },
            'r' => match rest.split_once(',') {
                Some((level, codes)) => match level.parse::<u8>() {
                    Ok(level) => self.raw_counters = Some((level, codes.to_string())),
                    Err(_) => warn!(token, "malformed raw counter level, ignored"),
                },
                None => warn!(token, "malformed raw counter list, ignored"),
            },
            'c' if rest.is_empty() => self.stats_output.csv = true,
            'f' if rest.is_empty() => self.stats_output.file = true,
            's' if rest.is_empty() => self.stats_output.summary = true,
            'C' => self.cgroup_override = Some(rest.to_string()),
            'o' => match rest.parse::<u8>() {
                Ok(level) => self.opencl_profiling = Some(level),
                Err(_) => warn!(token, "malformed profiling level, ignored"),
            },
            _ => warn!(token, "unknown tuning flag, ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn a_full_flag_string_parses() {
        let options = RtLibOptions::parse("Ds30:G:p2:r1,0x3c,0x4f:c:s:Cuser.slice:o1");
        assert_eq!(options.duration, Some(DurationLimit::Seconds(30)));
        assert_eq!(options.counter_scope, CounterScope::Global);
        assert_eq!(options.perf_verbosity, Some(2));
        assert_eq!(
            options.raw_counters,
            Some((1, "0x3c,0x4f".to_string()))
        );
        assert!(options.stats_output.csv);
        assert!(!options.stats_output.file);
        assert!(options.stats_output.summary);
        assert_eq!(options.cgroup_override.as_deref(), Some("user.slice"));
        assert_eq!(options.opencl_profiling, Some(1));
    }

    #[test]
    fn cycle_limits_and_unmanaged_mode_parse() {
        let options = RtLibOptions::parse("Dc1000:U2");
        assert_eq!(options.duration, Some(DurationLimit::Cycles(1000)));
        assert_eq!(options.unmanaged_awm, Some(2));
    }

    #[test]
    fn malformed_and_unknown_tokens_are_skipped() {
        let options = RtLibOptions::parse("Dx9:U:zz::p1");
        assert_eq!(options.duration, None);
        assert_eq!(options.unmanaged_awm, None);
        assert_eq!(options.perf_verbosity, Some(1));
    }
}
