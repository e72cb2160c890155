//! Plugin name rewriting between the ECU-side and server-side conventions.

/// Extension of plugin archives as staged on the vehicle.
pub const STAGED_EXTENSION: &str = ".zip";

/// Extension the trusted server expects in acknowledgments.
pub const SERVER_EXTENSION: &str = ".suite";

/// Rewrite a plugin name into the form the trusted server expects.
///
/// Every occurrence of [`STAGED_EXTENSION`] becomes [`SERVER_EXTENSION`];
/// names without it pass through unchanged. Idempotent.
pub fn to_server_name(plugin_name: &str) -> String {
    if plugin_name.contains(STAGED_EXTENSION) {
        plugin_name.replace(STAGED_EXTENSION, SERVER_EXTENSION)
    } else {
        plugin_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rewrites_zip_suffix() {
        assert_eq!(to_server_name("foo.zip"), "foo.suite");
    }

    #[test]
    fn test_passes_through_other_names() {
        assert_eq!(to_server_name("foo.jar"), "foo.jar");
        assert_eq!(to_server_name("foo.suite"), "foo.suite");
        assert_eq!(to_server_name(""), "");
    }

    proptest! {
        #[test]
        fn prop_rewrite_is_idempotent(name in ".{0,32}") {
            let once = to_server_name(&name);
            prop_assert_eq!(to_server_name(&once), once.clone());
            prop_assert!(!once.contains(STAGED_EXTENSION));
        }

        #[test]
        fn prop_names_without_extension_unchanged(name in "[a-y_/]{0,32}") {
            prop_assert_eq!(to_server_name(&name), name);
        }
    }
}
