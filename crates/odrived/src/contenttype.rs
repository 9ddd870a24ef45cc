//! Content-type inference from a file name, used when the metadata omits one.

use std::path::Path;

pub const FALLBACK: &str = "text/plain";

pub fn guess_content_type(file_name: &str) -> String {
    let Some(ext) = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
    else {
        return FALLBACK.to_string();
    };
    let ext = ext.to_lowercase();
    let known = match ext.as_str() {
        "js" => "application/javascript",
        "css" => "text/css",
        "htm" | "html" => "text/html",
        "txt" => "text",
        "mp3" => "audio/mp3",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "m4v" | "mp4" => "video/mp4",
        "mov" => "video/mov",
        _ => return format!("application/{ext}"),
    };
    known.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table() {
        assert_eq!(guess_content_type("a.txt"), "text");
        assert_eq!(guess_content_type("index.HTML"), "text/html");
        assert_eq!(guess_content_type("photo.JPEG"), "image/jpeg");
        assert_eq!(guess_content_type("clip.m4v"), "video/mp4");
        assert_eq!(guess_content_type("song.mp3"), "audio/mp3");
    }

    #[test]
    fn test_unknown_extension_becomes_application() {
        assert_eq!(guess_content_type("report.pdf"), "application/pdf");
        assert_eq!(guess_content_type("archive.tar.GZ"), "application/gz");
    }

    #[test]
    fn test_no_extension_falls_back() {
        assert_eq!(guess_content_type("README"), FALLBACK);
        assert_eq!(guess_content_type(""), FALLBACK);
        assert_eq!(guess_content_type("trailing."), FALLBACK);
    }
}
