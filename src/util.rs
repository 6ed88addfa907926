//! Small shared helpers.

/// Render raw frame bytes as space-separated uppercase hex for log lines.
pub(crate) fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
