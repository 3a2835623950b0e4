use std::io::{self, Write};

use env_logger::{Env, fmt::Formatter};
use log::{Level, Record};

/// Initializes `env_logger`, honouring `RUST_LOG` and defaulting to `info`.
pub fn init() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(format)
        .init();
}

fn format(f: &mut Formatter, record: &Record) -> io::Result<()> {
    let level = record.level();
    let prefix_style = f.default_level_style(level);
    let prefix = level_prefix(level);
    writeln!(f, "{prefix_style}{prefix}{prefix_style:#}{}", record.args())
}

fn level_prefix(level: Level) -> &'static str {
    match level {
        Level::Debug | Level::Trace | Level::Info => "",
        Level::Warn => "warning: ",
        Level::Error => "error: ",
    }
}
