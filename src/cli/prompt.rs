use nix::sys::termios::{LocalFlags, SetArg, Termios, tcgetattr, tcsetattr};
use std::io::{BufRead, Write};
use std::os::fd::AsFd;
use std::path::Path;
use tracing::debug;

use crate::core::remote::ssh::PassphrasePrompt;

/// Asks on the controlling terminal with echo off.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

/// Restores the saved terminal mode on drop. Holds nothing when stdin is not a terminal.
struct EchoGuard(Option<Termios>);

impl EchoGuard {
    fn disable() -> Self {
        let stdin = std::io::stdin();
        let Ok(original) = tcgetattr(stdin.as_fd()) else {
            return Self(None);
        };
        let mut silent = original.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        match tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &silent) {
            Ok(()) => Self(Some(original)),
            Err(e) => {
                debug!(error = %e, "Could not turn off terminal echo");
                Self(None)
            }
        }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        if let Some(original) = self.0.take()
            && let Err(e) = tcsetattr(std::io::stdin().as_fd(), SetArg::TCSANOW, &original)
        {
            debug!(error = %e, "Could not restore terminal echo");
        }
    }
}

impl PassphrasePrompt for TerminalPrompt {
    fn passphrase(&self, key: &Path) -> Option<String> {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "Passphrase for {}: ", key.display());
        let _ = stderr.flush();

        let mut line = String::new();
        let read = {
            let _echo = EchoGuard::disable();
            std::io::stdin().lock().read_line(&mut line)
        };
        let _ = writeln!(stderr);

        read.ok()?;
        let passphrase = line.trim_end_matches(['\r', '\n']).to_string();
        (!passphrase.is_empty()).then_some(passphrase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_guard_restores_the_terminal_mode() {
        let before = tcgetattr(std::io::stdin().as_fd()).ok();
        let guard = EchoGuard::disable();
        assert_eq!(guard.0.is_some(), before.is_some());
        drop(guard);

        let after = tcgetattr(std::io::stdin().as_fd()).ok();
        assert_eq!(
            before.map(|t| t.local_flags),
            after.map(|t| t.local_flags)
        );
    }
}
