//! `granule-watch config`

use crate::config::Settings;

pub fn run(settings: &Settings) -> Result<(), toml::ser::Error> {
    println!("{}", settings.to_toml()?);
    Ok(())
}
