//! Mapping from `-v` counts to log levels.

use crate::level::Level;

/// The minimum console verbosity implied by a number of `-v` flags. The
/// mapping is cumulative: each step widens what the console shows.
#[must_use]
pub fn verbosity_floor(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::Critical,
        1 => Level::Warning,
        2 => Level::Info,
        3 => Level::Debug,
        4 => Level::DebugHandling,
        _ => Level::DebugPackets,
    }
}

/// The effective level for a console handler configured at `configured`
/// when the command line asked for `verbosity`. Verbosity only ever raises
/// the console above its configured level, never lowers it.
#[must_use]
pub fn console_level(configured: Level, verbosity: u8) -> Level {
    configured.max(verbosity_floor(verbosity))
}

#[cfg(test)]
mod tests {
    use super::{console_level, verbosity_floor};
    use crate::level::Level;

    #[test]
    fn floor_steps_through_all_levels() {
        assert_eq!(verbosity_floor(0), Level::Critical);
        assert_eq!(verbosity_floor(1), Level::Warning);
        assert_eq!(verbosity_floor(2), Level::Info);
        assert_eq!(verbosity_floor(3), Level::Debug);
        assert_eq!(verbosity_floor(4), Level::DebugHandling);
        assert_eq!(verbosity_floor(5), Level::DebugPackets);
        assert_eq!(verbosity_floor(17), Level::DebugPackets);
    }

    #[test]
    fn verbosity_never_lowers_a_configured_level() {
        // Each row: configured level, -v count, expected effective level.
        let table = [
            (Level::Critical, 0, Level::Critical),
            (Level::Critical, 1, Level::Warning),
            (Level::Critical, 2, Level::Info),
            (Level::Critical, 3, Level::Debug),
            (Level::Critical, 4, Level::DebugHandling),
            (Level::Critical, 5, Level::DebugPackets),
            (Level::Error, 0, Level::Error),
            (Level::Error, 1, Level::Warning),
            (Level::Warning, 0, Level::Warning),
            (Level::Warning, 1, Level::Warning),
            (Level::Info, 1, Level::Info),
            (Level::Info, 2, Level::Info),
            (Level::Info, 3, Level::Debug),
            (Level::Debug, 2, Level::Debug),
            (Level::Debug, 4, Level::DebugHandling),
            (Level::DebugHandling, 3, Level::DebugHandling),
            (Level::DebugHandling, 5, Level::DebugPackets),
            (Level::DebugPackets, 0, Level::DebugPackets),
            (Level::DebugPackets, 5, Level::DebugPackets),
        ];

        for (configured, verbosity, expected) in table {
            assert_eq!(
                console_level(configured, verbosity),
                expected,
                "configured {configured:?} with -v x{verbosity}"
            );
        }
    }
}
