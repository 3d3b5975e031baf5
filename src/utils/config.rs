//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// the listed fields by parsing from the given TOML string if it's not
/// `None`. Keys not in the list are rejected. Returns an `Ok(config)` on
/// success, and `Err(FamstoreError)` on parser failure.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => NodeConfig; tolerance, ledger_path)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::FamstoreError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;
            $({
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // anything left over is not a recognized field
            if let Some(key) = table.keys().next() {
                return Err($crate::FamstoreError::msg(format!(
                    "invalid field name '{}' in config",
                    key
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}
