use std::path::Path;

use flexi_logger::{FileSpec, FlexiLoggerError, LogSpecification, Logger, LoggerHandle};
use log::LevelFilter;

/// Start logging at `level`, to `log_file` if given and to stderr otherwise.
///
/// The lock screen owns the terminal, so anything written to stderr while it
/// is up lands on the alternate screen and vanishes with it.
pub fn setup_logger(
    level: LevelFilter,
    log_file: Option<&Path>,
) -> Result<LoggerHandle, FlexiLoggerError> {
    let spec = LogSpecification::builder().default(level).build();
    let logger = Logger::with(spec).format(flexi_logger::detailed_format);

    match log_file {
        Some(path) => logger
            .log_to_file(FileSpec::try_from(path)?)
            .append()
            .start(),
        None => logger.log_to_stderr().start(),
    }
}
