//! Latency injection for syscalls that match a tamper rule.
//!
//! At most one rule set is active at a time. It is replaced by every
//! successful non-empty [`Tamper::parse`] and consulted by [`Tamper::delay`],
//! usually from a syscall handler. `Tamper` has no interior mutability:
//! re-parsing needs `&mut`, so it cannot race a delay check on the same value.

use std::{thread, time::Duration};

use log::{debug, info};
use syscalls::{Sysno, SysnoSet};
use thiserror::Error;

use crate::syscall::Syscall;

/// How long a matching syscall is held up.
pub const TAMPER_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid tamper rule {input:?}: {reason}")]
pub struct ParseError {
    pub input: String,
    pub reason: String,
}

/// A compiled rule set.
pub trait Filter {
    /// Whether `call` is selected. `exit_view` asks the rule to look at the
    /// call as it appears at syscall exit.
    fn matches(&self, call: &Syscall, exit_view: bool) -> bool;
}

/// Compiles rule expressions into a [`Filter`].
pub trait FilterParser {
    type Filter: Filter;

    fn parse(&self, input: &str) -> Result<Self::Filter, ParseError>;
}

/// Holds the active filter and applies the delay.
pub struct Tamper<P: FilterParser> {
    parser: P,
    active: Option<P::Filter>,
}

impl<P: FilterParser> Tamper<P> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            active: None,
        }
    }

    pub fn active(&self) -> Option<&P::Filter> {
        self.active.as_ref()
    }

    /// Compile `input` and make it the active filter.
    ///
    /// Empty input returns `Ok(None)` and keeps the current filter. A
    /// malformed rule returns the error and keeps it too.
    pub fn parse(&mut self, input: &str) -> Result<Option<&P::Filter>, ParseError> {
        if input.is_empty() {
            return Ok(None);
        }
        let filter = self.parser.parse(input)?;
        info!("tampering with syscalls matching {:?}", input);
        Ok(Some(&*self.active.insert(filter)))
    }

    /// Block for [`TAMPER_DELAY`] if the active filter selects `call`.
    ///
    /// The filter always sees the exit view, whichever half of the call
    /// this is invoked from.
    pub fn delay(&self, call: &Syscall) {
        let Some(filter) = self.active.as_ref() else {
            return;
        };
        if filter.matches(call, true) {
            debug!("delaying {} by {:?}", call, TAMPER_DELAY);
            thread::sleep(TAMPER_DELAY);
        }
    }
}

/// Rules written as a comma separated list of syscall names, `read,openat`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallNames;

/// The syscalls selected by a [`SyscallNames`] rule.
#[derive(Debug, Clone)]
pub struct NameFilter {
    syscalls: SysnoSet,
}

impl NameFilter {
    pub fn contains(&self, sysno: Sysno) -> bool {
        self.syscalls.contains(sysno)
    }
}

impl Filter for NameFilter {
    fn matches(&self, call: &Syscall, _exit_view: bool) -> bool {
        call.sysno().is_some_and(|sysno| self.syscalls.contains(sysno))
    }
}

impl FilterParser for SyscallNames {
    type Filter = NameFilter;

    fn parse(&self, input: &str) -> Result<NameFilter, ParseError> {
        let error = |reason: String| ParseError {
            input: input.to_string(),
            reason,
        };

        let mut selected = Vec::new();
        for (i, name) in input.split(',').map(str::trim).enumerate() {
            if name.is_empty() {
                return Err(error(format!("empty syscall name at position {}", i)));
            }
            let sysno = name
                .parse::<Sysno>()
                .map_err(|_| error(format!("unknown syscall {:?}", name)))?;
            selected.push(sysno);
        }
        Ok(NameFilter {
            syscalls: SysnoSet::new(&selected),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use nix::unistd::Pid;

    use super::*;
    use crate::regs::Registers;

    fn call(nr: Sysno, exit: bool) -> Syscall {
        Syscall::new(Pid::from_raw(1), Registers::new(nr as i64, [0; 6]), exit)
    }

    #[test]
    fn parses_name_lists() {
        let filter = SyscallNames.parse("read, openat").unwrap();
        assert!(filter.contains(Sysno::read));
        assert!(filter.contains(Sysno::openat));
        assert!(!filter.contains(Sysno::write));
    }

    #[test]
    fn rejects_malformed_rules() {
        let err = SyscallNames.parse("read,,write").unwrap_err();
        assert_eq!(err.input, "read,,write");
        assert!(SyscallNames.parse("not_a_syscall").is_err());
    }

    #[test]
    fn empty_input_keeps_active_filter() {
        let mut tamper = Tamper::new(SyscallNames);
        assert!(tamper.parse("read").unwrap().is_some());

        assert!(tamper.parse("").unwrap().is_none());
        assert!(tamper.active().unwrap().contains(Sysno::read));
    }

    #[test]
    fn empty_input_without_filter_stays_inactive() {
        let mut tamper = Tamper::new(SyscallNames);
        assert!(tamper.parse("").unwrap().is_none());
        assert!(tamper.active().is_none());
    }

    #[test]
    fn malformed_input_keeps_active_filter() {
        let mut tamper = Tamper::new(SyscallNames);
        tamper.parse("write").unwrap();

        assert!(tamper.parse("write,bogus").is_err());
        let active = tamper.active().unwrap();
        assert!(active.contains(Sysno::write));
        assert!(!active.contains(Sysno::read));
    }

    #[test]
    fn last_parse_wins() {
        let mut tamper = Tamper::new(SyscallNames);
        tamper.parse("write").unwrap();
        tamper.parse("read").unwrap();

        let active = tamper.active().unwrap();
        assert!(active.contains(Sysno::read));
        assert!(!active.contains(Sysno::write));
    }

    #[test]
    fn no_filter_means_no_delay() {
        let tamper = Tamper::new(SyscallNames);
        let start = Instant::now();
        tamper.delay(&call(Sysno::read, false));
        assert!(start.elapsed() < TAMPER_DELAY);
    }

    #[test]
    fn matching_call_is_delayed() {
        let mut tamper = Tamper::new(SyscallNames);
        tamper.parse("read").unwrap();

        let start = Instant::now();
        tamper.delay(&call(Sysno::read, false));
        assert!(start.elapsed() >= TAMPER_DELAY);

        let start = Instant::now();
        tamper.delay(&call(Sysno::write, false));
        assert!(start.elapsed() < TAMPER_DELAY);
    }

    struct ExitOnly;

    impl Filter for ExitOnly {
        fn matches(&self, _call: &Syscall, exit_view: bool) -> bool {
            exit_view
        }
    }

    struct ExitOnlyParser;

    impl FilterParser for ExitOnlyParser {
        type Filter = ExitOnly;

        fn parse(&self, _input: &str) -> Result<ExitOnly, ParseError> {
            Ok(ExitOnly)
        }
    }

    #[test]
    fn enter_events_are_matched_with_exit_view() {
        let mut tamper = Tamper::new(ExitOnlyParser);
        tamper.parse("anything").unwrap();

        let start = Instant::now();
        tamper.delay(&call(Sysno::getpid, false));
        assert!(start.elapsed() >= TAMPER_DELAY);
    }
}
