//! What an rsync exit status means for a deployment

/// Error starting client-server protocol; a daemon answers this way when the
/// module or the module's path does not exist
pub const RERR_STARTCLIENT: i32 = 5;
/// Error in socket I/O
pub const RERR_SOCKETIO: i32 = 10;
/// Received SIGUSR1 or SIGINT
pub const RERR_SIGNAL: i32 = 20;
/// Partial transfer due to error
pub const RERR_PARTIAL: i32 = 23;
/// Partial transfer due to vanished source files
pub const RERR_VANISHED: i32 = 24;
/// Timeout waiting for daemon connection
pub const RERR_CONTIMEOUT: i32 = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    ModuleMissing,
    ConnectionRefused,
    Canceled,
    Failed(i32),
}

/// Map an exit code to its meaning
///
/// A partial transfer is still a success when the daemon excluded files on
/// purpose: the excluded paths are exactly what it refused to write.
pub fn classify(code: i32, excluded: u64) -> ExitClass {
    match code {
        0 => ExitClass::Success,
        RERR_PARTIAL | RERR_VANISHED if excluded > 0 => ExitClass::Success,
        RERR_STARTCLIENT => ExitClass::ModuleMissing,
        RERR_SOCKETIO | RERR_CONTIMEOUT => ExitClass::ConnectionRefused,
        RERR_SIGNAL => ExitClass::Canceled,
        other => ExitClass::Failed(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(classify(0, 0), ExitClass::Success);
        assert_eq!(classify(5, 0), ExitClass::ModuleMissing);
        assert_eq!(classify(10, 0), ExitClass::ConnectionRefused);
        assert_eq!(classify(35, 0), ExitClass::ConnectionRefused);
        assert_eq!(classify(20, 0), ExitClass::Canceled);
        assert_eq!(classify(12, 3), ExitClass::Failed(12));
    }

    #[test]
    fn partial_transfers_need_exclusions() {
        assert_eq!(classify(23, 2), ExitClass::Success);
        assert_eq!(classify(24, 1), ExitClass::Success);
        assert_eq!(classify(23, 0), ExitClass::Failed(23));
        assert_eq!(classify(24, 0), ExitClass::Failed(24));
    }
}
