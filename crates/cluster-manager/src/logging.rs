use colored::{ColoredString, Colorize};
use env_logger::Env;
use log::warn;
use std::io::Write;

/// The log line tag under which this service reports.
pub fn service_tag() -> ColoredString {
    "[cluster-manager]".cyan().bold()
}

/// Initializes the logger with a UTC timestamp, colored level and service
/// tag. The level defaults to `INFO` and can be overridden through the
/// `RUST_LOG` environment variable.
pub fn init_logging(name: ColoredString) {
    if env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(move |buf, record| {
            let t = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "{t} {level_style}{}{level_style:#} {name} {}",
                record.level(),
                record.args()
            )
        })
        .try_init()
        .is_err()
    {
        warn!("Unable to initialize logging -- has it already been initialized?")
    }
}
