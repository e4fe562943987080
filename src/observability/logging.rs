use fern::colors::{Color, ColoredLevelConfig};
use log::Level;

/// Install a stderr logger at `level`: `timestamp LEVEL target: message`.
///
/// Fails when a logger is already installed.
pub fn init_logging(level: Level) -> anyhow::Result<()> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::Magenta);

	fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:<5} {}: {}",
				chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.level(level.to_level_filter())
		// Keep HTTP client internals quiet unless explicitly debugging them.
		.level_for("hyper", log::LevelFilter::Warn)
		.level_for("reqwest", log::LevelFilter::Warn)
		.chain(std::io::stderr())
		.apply()
		.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

	Ok(())
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn logging_initialization() {
		// Only the first install in a process succeeds.
		let first = super::init_logging(log::Level::Debug);
		let second = super::init_logging(log::Level::Info);
		assert!(first.is_err() || second.is_err());
	}
}
