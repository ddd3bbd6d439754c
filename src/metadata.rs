use crate::playback::TrackRef;

const TOPIC_SUFFIX: &str = " - topic";
const RELEASE_TOPIC_SUFFIX: &str = "release - topic";

/// Canonical fields submitted to the tracking service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMetadata {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    pub duration_secs: u64,
}

/// Normalizes a captured track into submittable metadata, or `None` when the
/// track cannot be attributed (streams, local files, raw http).
pub fn resolve(track: &TrackRef) -> Option<TrackMetadata> {
    if !track.is_submittable() {
        return None;
    }
    let source = track.source();

    let (artist, title) = if source.is_video_platform() {
        if track.native_id.is_some() {
            split_uploaded_title(&track.author, &track.title)
        } else {
            (track.author.as_str(), track.single_title.as_str())
        }
    } else {
        (track.author.as_str(), track.single_title.as_str())
    };

    let album = match track.album.as_deref().filter(|album| !album.is_empty()) {
        Some(album) => Some(album.to_string()),
        None if !track.autoplay && source.is_full_catalog() => Some(track.single_title.clone()),
        None => None,
    };

    Some(TrackMetadata {
        artist: first_credit(artist).to_string(),
        title: title.to_string(),
        album,
        duration_secs: track.duration_ms / 1000,
    })
}

// "Artist - Topic" channels name the artist; otherwise expect "Artist - Title".
fn split_uploaded_title<'a>(author: &'a str, title: &'a str) -> (&'a str, &'a str) {
    if let Some(channel) = strip_suffix_ignore_ascii_case(author, TOPIC_SUFFIX)
        && strip_suffix_ignore_ascii_case(author, RELEASE_TOPIC_SUFFIX).is_none()
        && !title.starts_with(channel)
    {
        return (channel, title);
    }
    match title.split_once(" - ") {
        Some((artist, name)) => (artist, name),
        None => (author, title),
    }
}

fn first_credit(artist: &str) -> &str {
    artist.split(',').next().unwrap_or(artist).trim()
}

fn strip_suffix_ignore_ascii_case<'a>(value: &'a str, suffix: &str) -> Option<&'a str> {
    let split = value.len().checked_sub(suffix.len())?;
    if !value.is_char_boundary(split) {
        return None;
    }
    let (head, tail) = value.split_at(split);
    tail.eq_ignore_ascii_case(suffix).then_some(head)
}
