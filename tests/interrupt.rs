//! Terminating signals are recorded process-wide, so this lives in its own
//! test binary.

use std::{cell::RefCell, rc::Rc};

use nix::sys::{
    signal::{kill, raise, Signal},
    wait::waitpid,
};
use syscall_tamper::{End, Error, Tracer};

#[test]
fn terminating_signal_interrupts_tracing() {
    let mut tracer = match Tracer::spawn("sleep", &["5"], true) {
        Ok(tracer) => tracer,
        Err(Error::Start { source, .. }) if source.raw_os_error() == Some(libc::EPERM) => {
            eprintln!("ptrace not permitted here, skipping");
            return;
        }
        Err(e) => panic!("spawn failed: {}", e),
    };
    let pid = tracer.pid();

    let exits: Rc<RefCell<Vec<i32>>> = Rc::default();
    let detached = Rc::new(RefCell::new(0));

    let codes = exits.clone();
    let detach_count = detached.clone();
    tracer
        .on_syscall_enter(|_| raise(Signal::SIGINT).unwrap())
        .on_process_exit(move |code| codes.borrow_mut().push(code))
        .on_detach(move |_| *detach_count.borrow_mut() += 1);

    assert_eq!(tracer.start().unwrap(), End::Interrupted(Signal::SIGINT));
    assert!(exits.borrow().is_empty());
    assert_eq!(*detached.borrow(), 1);

    // still stopped under us
    kill(pid, Signal::SIGKILL).unwrap();
    waitpid(pid, None).unwrap();
}
