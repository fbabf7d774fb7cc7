use crate::{
    error::{Error, Result},
    syscall::Syscall,
};

/// Tracks the enter/exit alternation of syscall-stops.
///
/// The kernel does not say whether a syscall-stop is an enter or an exit, so
/// the phase is inferred by counting: every syscall-stop flips it. A stop that
/// goes unnoticed (a swallowed signal, say) shifts the count by one, which
/// shows up as an exit whose number differs from the enter before it.
#[derive(Debug, Default)]
pub struct Pairing {
    exit: bool,
    last: Option<Syscall>,
}

impl Pairing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_exit(&self) -> bool {
        self.exit
    }

    #[cfg(test)]
    pub(crate) fn last(&self) -> Option<&Syscall> {
        self.last.as_ref()
    }

    /// Check an exit event against its enter event and carry over the
    /// enter event's resolved fields.
    pub fn pair(&self, call: &mut Syscall) -> Result<()> {
        if !self.exit {
            return Ok(());
        }
        let Some(enter) = self.last.as_ref().filter(|last| last.pid == call.pid) else {
            return Ok(());
        };
        if enter.number() != call.number() {
            return Err(Error::PairingMismatch {
                pid: call.pid,
                enter: enter.number(),
                exit: call.number(),
            });
        }
        call.reuse(enter);
        Ok(())
    }

    /// Record a dispatched event and flip the phase.
    pub fn advance(&mut self, call: Syscall) {
        self.last = Some(call);
        self.exit = !self.exit;
    }
}
