//! Banner and preview formatting.

const MAX_PREVIEW_CHARS: usize = 50;

/// Print the application banner.
pub fn print_banner() {
    println!("\n\x1b[1;36m╔══════════════════════════════════════╗\x1b[0m");
    println!("\x1b[1;36m║\x1b[0m         \x1b[1mClipSync\x1b[0m                     \x1b[1;36m║\x1b[0m");
    println!("\x1b[1;36m║\x1b[0m      LAN clipboard sync engine       \x1b[1;36m║\x1b[0m");
    println!("\x1b[1;36m╚══════════════════════════════════════╝\x1b[0m\n");
}

/// Single-line preview of clipboard text.
pub fn format_preview(text: &str) -> String {
    let flat = text.replace(['\n', '\r'], " ");
    if flat.chars().count() > MAX_PREVIEW_CHARS {
        let cut: String = flat.chars().take(MAX_PREVIEW_CHARS).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(60);
        let preview = format_preview(&long);
        assert_eq!(preview.chars().count(), MAX_PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_preview_flattens_newlines() {
        assert_eq!(format_preview("a\nb"), "a b");
    }
}
