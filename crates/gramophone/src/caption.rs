use tidal::ArtistRole;

use crate::staging::{Credit, TrackInfo};

pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn blockquote(text: &str) -> String {
    format!("<blockquote>{}</blockquote>", escape(text))
}

pub fn italic(text: &str) -> String {
    format!("<i>{}</i>", escape(text))
}

pub fn code(text: &str) -> String {
    format!("<code>{}</code>", escape(text))
}

/// Display credit line: main artists comma-joined, featured artists in a
/// trailing parenthetical.
pub fn join_artists(artists: &[Credit]) -> String {
    let mains: Vec<&str> = artists
        .iter()
        .filter(|artist| artist.role != ArtistRole::Featured)
        .map(|artist| artist.name.as_str())
        .collect();
    let featured: Vec<&str> = artists
        .iter()
        .filter(|artist| artist.role == ArtistRole::Featured)
        .map(|artist| artist.name.as_str())
        .collect();

    let mut out = mains.join(", ");
    if !featured.is_empty() {
        out.push_str(&format!(" (feat. {})", featured.join(", ")));
    }
    out
}

/// Caption of a media group's last item. `volume` is set for albums
/// only; `part` is this group's position within its volume or listing.
pub fn group_caption(
    info_caption: &str,
    volume: Option<u32>,
    part: (usize, usize),
    signature: Option<&str>,
) -> String {
    let mut tail = Vec::new();
    if let Some(volume) = volume {
        tail.push(format!("Volume: {volume}"));
    }
    tail.push(format!("Part: {}/{}", part.0, part.1));

    let mut caption = format!("{}\n\n{}", blockquote(info_caption), italic(&tail.join(", ")));
    if let Some(signature) = signature {
        caption.push('\n');
        caption.push_str(signature);
    }
    caption
}

/// Caption of a lone track message.
pub fn single_caption(info_caption: &str, signature: Option<&str>) -> String {
    let mut caption = blockquote(info_caption);
    if let Some(signature) = signature {
        caption.push('\n');
        caption.push_str(signature);
    }
    caption
}

/// Display title: `title (version)` when a version qualifier exists.
pub fn titled(title: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => format!("{title} ({version})"),
        None => title.to_owned(),
    }
}

/// Upload-time filename, built from the info record; staging names are
/// content ids.
pub fn filename(info: &TrackInfo) -> String {
    let base = format!(
        "{} - {}",
        join_artists(&info.artists),
        titled(&info.title, info.version.as_deref()),
    );
    format!("{}.{}", sanitize(&base), info.extension)
}

fn sanitize(s: &str) -> String {
    s.replace(
        ['/', '\\', ':', '*', '?', '"', '<', '>', '|'],
        "_",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credit(name: &str, role: ArtistRole) -> Credit {
        Credit {
            name: name.to_owned(),
            role,
        }
    }

    #[test]
    fn join_artists_formats_featured() {
        let artists = vec![
            credit("A", ArtistRole::Main),
            credit("B", ArtistRole::Main),
            credit("C", ArtistRole::Featured),
        ];
        assert_eq!(join_artists(&artists), "A, B (feat. C)");
    }

    #[test]
    fn join_artists_without_featured_has_no_parenthetical() {
        let artists = vec![credit("A", ArtistRole::Main), credit("B", ArtistRole::Main)];
        assert_eq!(join_artists(&artists), "A, B");
    }

    #[test]
    fn join_artists_multiple_featured() {
        let artists = vec![
            credit("A", ArtistRole::Main),
            credit("X", ArtistRole::Featured),
            credit("Y", ArtistRole::Featured),
        ];
        assert_eq!(join_artists(&artists), "A (feat. X, Y)");
    }

    #[test]
    fn group_caption_volume_and_part() {
        let caption = group_caption("Artist - Album", Some(2), (2, 2), None);
        assert_eq!(
            caption,
            "<blockquote>Artist - Album</blockquote>\n\n<i>Volume: 2, Part: 2/2</i>"
        );
    }

    #[test]
    fn group_caption_listing_has_no_volume() {
        let caption = group_caption("road trip", None, (1, 1), Some("<a href=\"https://example.com\">mirrored</a>"));
        assert_eq!(
            caption,
            "<blockquote>road trip</blockquote>\n\n<i>Part: 1/1</i>\n<a href=\"https://example.com\">mirrored</a>"
        );
    }

    #[test]
    fn captions_escape_html() {
        assert_eq!(
            single_caption("Tom & <Jerry>", None),
            "<blockquote>Tom &amp; &lt;Jerry&gt;</blockquote>"
        );
    }

    #[test]
    fn filename_from_info_record() {
        let info = TrackInfo {
            title: "No Title".to_owned(),
            version: Some("Remastered".to_owned()),
            artists: vec![
                credit("AC/DC", ArtistRole::Main),
                credit("Guest", ArtistRole::Featured),
            ],
            duration: 251,
            cover_id: None,
            mime_type: "audio/flac".to_owned(),
            codec: "flac".to_owned(),
            extension: "flac".to_owned(),
            caption: String::new(),
        };
        assert_eq!(
            filename(&info),
            "AC_DC (feat. Guest) - No Title (Remastered).flac"
        );
    }
}
