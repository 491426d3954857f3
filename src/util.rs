/// Renders raw protocol bytes for logs, escaping anything non-printable.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input.escape_ascii().to_string()
}
