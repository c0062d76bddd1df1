//! File extension classification for external storage accounting.

/// Media bucket a file is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Image,
}

const AUDIO: &[&str] = &[
    "3ga", "aac", "aif", "aifc", "aiff", "amr", "awb", "flac", "imy", "m3u", "m4a", "mid",
    "midi", "mka", "mp2", "mp3", "mpga", "mxmf", "oga", "ogg", "opus", "ota", "pls", "ra",
    "rtttl", "rtx", "smf", "snd", "wav", "wax", "wma", "xmf",
];

const VIDEO: &[&str] = &[
    "3g2", "3gp", "3gpp", "3gpp2", "asf", "avi", "dif", "dl", "dv", "fli", "flv", "lsf", "lsx",
    "m4v", "mkv", "mng", "mov", "mp4", "mpe", "mpeg", "mpg", "mts", "mxu", "qt", "ts", "webm",
    "wm", "wmv", "wmx", "wvx",
];

const IMAGE: &[&str] = &[
    "arw", "bmp", "cr2", "dng", "gif", "heic", "heif", "ico", "jpe", "jpeg", "jpg", "nef",
    "nrw", "orf", "pbm", "pcx", "pef", "pgm", "png", "pnm", "ppm", "raf", "ras", "rgb", "rw2",
    "srw", "svg", "svgz", "tif", "tiff", "wbmp", "webp", "xbm", "xpm", "xwd",
];

/// Classify a file by the extension after its last `.`, ignoring case.
pub fn match_extension(file_name: &str) -> Option<MediaKind> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if AUDIO.contains(&ext.as_str()) {
        Some(MediaKind::Audio)
    } else if VIDEO.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else if IMAGE.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else {
        None
    }
}
