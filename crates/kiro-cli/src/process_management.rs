//! Process-group leadership setup so that killing the orchestrator also
//! reaches every subprocess it spawned (test runners, code generators).

#[cfg(unix)]
pub fn setup_process_group() {
    use nix::errno::Errno;
    use nix::unistd::{getpgrp, setpgid, tcgetpgrp, Pid};
    use std::io::{stdin, stdout, IsTerminal};
    use tracing::debug;

    let pid = Pid::this();
    let pgrp = getpgrp();
    if pgrp == pid {
        debug!(pid = %pid, "already process group leader");
        return;
    }

    if is_foreground_tty_group(pgrp) {
        debug!(pgrp = %pgrp, "keeping foreground process group");
        return;
    }

    if let Err(e) = setpgid(pid, pid) {
        if e != Errno::EPERM {
            debug!(error = %e, "could not set process group, continuing anyway");
        }
    }

    fn is_foreground_tty_group(current_pgrp: Pid) -> bool {
        if stdin().is_terminal() {
            if let Ok(fg) = tcgetpgrp(stdin()) {
                return fg == current_pgrp;
            }
        }
        if stdout().is_terminal() {
            if let Ok(fg) = tcgetpgrp(stdout()) {
                return fg == current_pgrp;
            }
        }
        false
    }
}

#[cfg(not(unix))]
pub fn setup_process_group() {}
