//! Config string parsing helper, mirroring the `parsed_config!` convention:
//! an optional TOML string is parsed into a `Default`-able, `#[serde(default)]`
//! struct, falling back field-by-field to defaults when absent.

/// Parses `$config_str` (an `Option<&str>` of TOML text) into `$struct_name`,
/// which must implement `Default + serde::Deserialize` with
/// `#[serde(default)]`. The trailing field list is not used at runtime; it
/// is type-checked against the struct at compile time so a typo'd field name
/// here is caught immediately rather than silently ignored by serde.
macro_rules! parsed_config {
    ($config_str:expr => $struct_name:ident; $($field:ident),+ $(,)?) => {{
        #[allow(unreachable_code, clippy::diverging_sub_expression)]
        fn _field_check() {
            if false {
                let c: $struct_name = unreachable!();
                $(let _ = c.$field;)+
            }
        }
        match $config_str {
            None => Ok::<_, $crate::utils::RingVoteError>($struct_name::default()),
            Some(s) if s.trim().is_empty() => {
                Ok::<_, $crate::utils::RingVoteError>($struct_name::default())
            }
            Some(s) => match toml::from_str::<$struct_name>(s) {
                Ok(c) => Ok(c),
                Err(e) => logged_err!("failed to parse config string: {}", e),
            },
        }
    }};
}
