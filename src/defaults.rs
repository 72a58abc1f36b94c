/// Compile-time link credentials.
///
/// Until a real configuration surface exists, bring-up builds join this
/// network. Production callers pass credentials to [`crate::link::Link::start`]
/// directly.
// TODO: route credentials from the host's configuration call instead of
// compiling them in.

/// Network joined by default bring-up builds.
pub const DEFAULT_SSID: &[u8] = b"airlink-test";

/// WPA2 passphrase for the default network; empty means open.
pub const DEFAULT_PASSPHRASE: &[u8] = b"password1234";
