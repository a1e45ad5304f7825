/// Detect Content-Type of a file part from its name.
///
/// Falls back to "application/octet-stream" for unknown extensions.
pub fn detect_content_type(file_name: &str) -> &'static str {
    mime_guess::from_path(file_name)
        .first_raw()
        .unwrap_or("application/octet-stream")
}
