//! TOML-backed configuration structs.

/// Builds a `$config_type` from its `Default`, then overrides each listed
/// field present in the optional TOML string `$config_str`. Evaluates to
/// `Result<$config_type, CbtxError>`; malformed TOML, a value of the wrong
/// type, or a key not in the field list is an error.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => MyConfig; cas_retries)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let overrides: Option<&str> = $config_str;
        let mut config = <$config_type as Default>::default();

        let apply = |text: &str| -> Result<(), $crate::CbtxError> {
            let mut table: toml::Table = text.parse()?;
            $(
                if let Some(val) = table.remove(stringify!($field)) {
                    config.$field = val.try_into().map_err(|e| {
                        $crate::CbtxError::msg(format!(
                            "bad value for '{}': {}",
                            stringify!($field),
                            e
                        ))
                    })?;
                }
            )+
            match table.keys().next() {
                Some(unknown) => Err($crate::CbtxError::msg(format!(
                    "unknown config field '{}'",
                    unknown
                ))),
                None => Ok(()),
            }
        };

        overrides.map_or(Ok(()), apply).map(|()| config)
    }};
}
