use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tidal::{AlbumId, MixId, PlaylistId, TrackId};

/// A provider resource the service can mirror. Artist and video links
/// match the grammar but are refused here, at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    Album(AlbumId),
    Playlist(PlaylistId),
    Mix(MixId),
    Track(TrackId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("artist links are unsupported")]
    UnsupportedArtist,

    #[error("video links are unsupported")]
    UnsupportedVideo,

    #[error("not a provider link")]
    NotALink,
}

static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https://(?:www\.|listen\.)?tidal\.com/(?:browse/)?(mix|playlist|album|artist|track|video)/([A-Za-z0-9-]+)(?:/u)?/?$",
    )
    .expect("link pattern must compile")
});

pub fn is_provider_link(url: &str) -> bool {
    LINK.is_match(url.trim())
}

pub fn parse(text: &str) -> Result<Link, LinkError> {
    let caps = LINK.captures(text.trim()).ok_or(LinkError::NotALink)?;
    let id = &caps[2];
    match &caps[1] {
        "album" => numeric(id).map(|id| Link::Album(id.into())),
        "track" => numeric(id).map(|id| Link::Track(id.into())),
        "playlist" => Ok(Link::Playlist(id.into())),
        "mix" => Ok(Link::Mix(id.into())),
        "artist" => Err(LinkError::UnsupportedArtist),
        "video" => Err(LinkError::UnsupportedVideo),
        _ => Err(LinkError::NotALink),
    }
}

fn numeric(id: &str) -> Result<u64, LinkError> {
    id.parse().map_err(|_| LinkError::NotALink)
}
