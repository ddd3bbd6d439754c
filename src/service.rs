use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ServiceKeys;
use crate::error::{ServiceError, TOKEN_NOT_AUTHORIZED_CODE};
use crate::metadata::TrackMetadata;

pub const LASTFM_API_URL: &str = "https://ws.audioscrobbler.com/2.0/";
pub const LASTFM_AUTH_URL: &str = "https://www.last.fm/api/auth/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub session_key: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenExchange {
    Authorized(SessionGrant),
    /// The user has not approved the token yet.
    Pending,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub name: String,
    pub real_name: Option<String>,
    pub url: Option<String>,
    pub country: Option<String>,
    pub registered: Option<DateTime<Utc>>,
    pub play_count: Option<u64>,
    pub track_count: Option<u64>,
    pub artist_count: Option<u64>,
    pub album_count: Option<u64>,
    pub image_url: Option<String>,
}

/// The remote music-tracking service.
#[async_trait]
pub trait TrackingService: Send + Sync {
    async fn request_token(&self) -> Result<String, ServiceError>;

    fn authorization_url(&self, token: &str) -> String;

    async fn exchange_token(&self, token: &str) -> Result<TokenExchange, ServiceError>;

    async fn submit_now_playing(
        &self,
        session_key: &str,
        track: &TrackMetadata,
    ) -> Result<(), ServiceError>;

    async fn submit_scrobble(
        &self,
        session_key: &str,
        track: &TrackMetadata,
        timestamp: DateTime<Utc>,
    ) -> Result<(), ServiceError>;

    async fn fetch_user_info(&self, session_key: &str) -> Result<UserProfile, ServiceError>;
}

pub struct LastFmClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    http: Client,
}

impl LastFmClient {
    pub fn new(keys: &ServiceKeys, base_url: Option<&str>) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .user_agent(concat!("fmrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            api_key: keys.api_key.clone(),
            api_secret: keys.api_secret.clone(),
            base_url: base_url.unwrap_or(LASTFM_API_URL).to_string(),
            http,
        })
    }

    async fn call(&self, method: &str, extra: Vec<(&str, String)>) -> Result<Value, ServiceError> {
        let mut params = vec![
            ("method".to_string(), method.to_string()),
            ("api_key".to_string(), self.api_key.clone()),
        ];
        params.extend(extra.into_iter().map(|(key, value)| (key.to_string(), value)));
        let api_sig = sign_params(&params, &self.api_secret);
        params.push(("api_sig".to_string(), api_sig));
        params.push(("format".to_string(), "json".to_string()));

        let text = self
            .http
            .post(&self.base_url)
            .form(&params)
            .send()
            .await?
            .text()
            .await?;
        debug!(method, response = %text, "tracking service response");
        parse_response(&text)
    }
}

fn track_params(session_key: &str, track: &TrackMetadata) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("artist", track.artist.clone()),
        ("track", track.title.clone()),
        ("sk", session_key.to_string()),
    ];
    if let Some(album) = &track.album {
        params.push(("album", album.clone()));
    }
    if track.duration_secs > 0 {
        params.push(("duration", track.duration_secs.to_string()));
    }
    params
}

#[async_trait]
impl TrackingService for LastFmClient {
    async fn request_token(&self) -> Result<String, ServiceError> {
        let json = self.call("auth.getToken", Vec::new()).await?;
        json.get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Decode("Missing token in response".to_string()))
    }

    fn authorization_url(&self, token: &str) -> String {
        format!("{LASTFM_AUTH_URL}?api_key={}&token={token}", self.api_key)
    }

    async fn exchange_token(&self, token: &str) -> Result<TokenExchange, ServiceError> {
        let json = match self
            .call("auth.getSession", vec![("token", token.to_string())])
            .await
        {
            Ok(json) => json,
            Err(err) if err.code() == Some(TOKEN_NOT_AUTHORIZED_CODE) => {
                return Ok(TokenExchange::Pending);
            }
            Err(err) => return Err(err),
        };
        let session = json
            .get("session")
            .ok_or_else(|| ServiceError::Decode("Missing session in response".to_string()))?;
        let field = |name: &str| {
            session
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ServiceError::Decode(format!("Missing session {name} in response")))
        };
        Ok(TokenExchange::Authorized(SessionGrant {
            session_key: field("key")?,
            username: field("name")?,
        }))
    }

    async fn submit_now_playing(
        &self,
        session_key: &str,
        track: &TrackMetadata,
    ) -> Result<(), ServiceError> {
        self.call("track.updateNowPlaying", track_params(session_key, track))
            .await?;
        Ok(())
    }

    async fn submit_scrobble(
        &self,
        session_key: &str,
        track: &TrackMetadata,
        timestamp: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut params = track_params(session_key, track);
        params.push(("timestamp", timestamp.timestamp().to_string()));
        let json = self.call("track.scrobble", params).await?;
        check_scrobble_result(json)
    }

    async fn fetch_user_info(&self, session_key: &str) -> Result<UserProfile, ServiceError> {
        let json = self
            .call("user.getInfo", vec![("sk", session_key.to_string())])
            .await?;
        let parsed: UserInfoResponse = serde_json::from_value(json)
            .map_err(|err| ServiceError::Decode(format!("user.getInfo: {err}")))?;
        Ok(parsed.user.into_profile())
    }
}

fn sign_params(params: &[(String, String)], secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut signature = String::new();
    for (key, value) in sorted {
        signature.push_str(&key);
        signature.push_str(&value);
    }
    signature.push_str(secret);
    format!("{:x}", md5::compute(signature))
}

fn parse_response(payload: &str) -> Result<Value, ServiceError> {
    let json: Value = serde_json::from_str(payload)
        .map_err(|err| ServiceError::Decode(format!("Failed parsing API response: {err}")))?;
    if let Some(error) = json.get("error") {
        let code = parse_u64_value(error).unwrap_or(0);
        let message = json
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("API error")
            .to_string();
        return Err(ServiceError::Api {
            code: u32::try_from(code).unwrap_or(u32::MAX),
            message,
        });
    }
    Ok(json)
}

fn check_scrobble_result(json: Value) -> Result<(), ServiceError> {
    let Ok(parsed) = serde_json::from_value::<ScrobbleResponse>(json) else {
        return Ok(());
    };
    let Some(scrobbles) = parsed.scrobbles else {
        return Ok(());
    };
    let ignored = scrobbles.attr.as_ref().map_or(0, |attr| attr.ignored);
    if ignored == 0 {
        return Ok(());
    }
    let (code, message) = match scrobbles.scrobble.as_ref().and_then(ScrobbleEntries::first_ignored) {
        Some(IgnoredMessage { code, text }) => (
            code.as_deref().and_then(|raw| raw.parse().ok()).unwrap_or(0),
            text.clone().unwrap_or_else(|| "Scrobble ignored".to_string()),
        ),
        None => (0, "Scrobble ignored".to_string()),
    };
    // 91 marks a duplicate the service already holds.
    if code == 91 {
        return Ok(());
    }
    Err(ServiceError::Api {
        code,
        message: format!("Scrobble ignored: {message}"),
    })
}

fn parse_u64_value(value: &Value) -> Option<u64> {
    if let Some(value) = value.as_u64() {
        return Some(value);
    }
    value.as_str().and_then(|raw| raw.parse::<u64>().ok())
}

#[derive(Debug, Deserialize)]
struct ScrobbleResponse {
    #[serde(default)]
    scrobbles: Option<Scrobbles>,
}

#[derive(Debug, Deserialize)]
struct Scrobbles {
    #[serde(rename = "@attr")]
    #[serde(default)]
    attr: Option<ScrobbleAttr>,
    #[serde(default)]
    scrobble: Option<ScrobbleEntries>,
}

#[derive(Debug, Deserialize)]
struct ScrobbleAttr {
    #[serde(default, deserialize_with = "deserialize_u64_string_or_number")]
    ignored: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScrobbleEntries {
    One(ScrobbleEntry),
    Many(Vec<ScrobbleEntry>),
}

impl ScrobbleEntries {
    fn first_ignored(&self) -> Option<&IgnoredMessage> {
        match self {
            ScrobbleEntries::One(entry) => entry.ignored_message.as_ref(),
            ScrobbleEntries::Many(entries) => entries
                .first()
                .and_then(|entry| entry.ignored_message.as_ref()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScrobbleEntry {
    #[serde(rename = "ignoredMessage")]
    #[serde(default)]
    ignored_message: Option<IgnoredMessage>,
}

#[derive(Debug, Deserialize)]
struct IgnoredMessage {
    #[serde(rename = "#text")]
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    user: UserInfo,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    name: String,
    #[serde(default)]
    realname: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    registered: Option<Registered>,
    #[serde(default, deserialize_with = "deserialize_optional_count")]
    playcount: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_optional_count")]
    track_count: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_optional_count")]
    artist_count: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_optional_count")]
    album_count: Option<u64>,
    #[serde(default)]
    image: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct Registered {
    #[serde(default, rename = "unixtime", deserialize_with = "deserialize_optional_count")]
    unixtime: Option<u64>,
    #[serde(default, rename = "#text", deserialize_with = "deserialize_optional_count")]
    text: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Image {
    #[serde(rename = "#text")]
    #[serde(default)]
    url: String,
}

impl UserInfo {
    fn into_profile(self) -> UserProfile {
        let non_empty = |value: Option<String>| value.filter(|value| !value.is_empty());
        let registered = self
            .registered
            .and_then(|registered| registered.unixtime.or(registered.text))
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        UserProfile {
            name: self.name,
            real_name: non_empty(self.realname),
            url: non_empty(self.url),
            country: non_empty(self.country),
            registered,
            play_count: self.playcount,
            track_count: self.track_count,
            artist_count: self.artist_count,
            album_count: self.album_count,
            image_url: non_empty(self.image.into_iter().last().map(|image| image.url)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrU64 {
    String(String),
    Number(u64),
}

fn deserialize_u64_string_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match StringOrU64::deserialize(deserializer)? {
        StringOrU64::String(value) => value.parse::<u64>().map_err(serde::de::Error::custom),
        StringOrU64::Number(value) => Ok(value),
    }
}

fn deserialize_optional_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<StringOrU64>::deserialize(deserializer)? {
        Some(StringOrU64::String(value)) => value.parse::<u64>().ok(),
        Some(StringOrU64::Number(value)) => Some(value),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn signature_sorts_params_and_appends_secret() {
        let params = vec![
            ("method".to_string(), "auth.getSession".to_string()),
            ("api_key".to_string(), "key".to_string()),
            ("token".to_string(), "tok".to_string()),
        ];
        let expected = format!(
            "{:x}",
            md5::compute("api_keykeymethodauth.getSessiontokentoksecret")
        );
        assert_eq!(sign_params(&params, "secret"), expected);
    }

    #[test]
    fn error_payload_becomes_coded_api_error() {
        let err = parse_response(r#"{"error": 9, "message": "Invalid session key"}"#).unwrap_err();
        assert!(err.is_session_revoked());

        let err = parse_response(r#"{"error": "14", "message": "Unauthorized Token"}"#).unwrap_err();
        assert_eq!(err.code(), Some(TOKEN_NOT_AUTHORIZED_CODE));

        assert!(matches!(
            parse_response("<html>"),
            Err(ServiceError::Decode(_))
        ));
    }

    #[test]
    fn ignored_scrobble_is_reported_unless_duplicate() {
        let accepted = json!({"scrobbles": {"@attr": {"accepted": 1, "ignored": 0}}});
        assert!(check_scrobble_result(accepted).is_ok());

        let ignored = json!({"scrobbles": {
            "@attr": {"accepted": "0", "ignored": "1"},
            "scrobble": {"ignoredMessage": {"code": "1", "#text": "Artist was ignored"}}
        }});
        let err = check_scrobble_result(ignored).unwrap_err();
        assert_eq!(err.code(), Some(1));

        let duplicate = json!({"scrobbles": {
            "@attr": {"accepted": 0, "ignored": 1},
            "scrobble": [{"ignoredMessage": {"code": "91", "#text": "dup"}}]
        }});
        assert!(check_scrobble_result(duplicate).is_ok());
    }

    #[test]
    fn user_info_parses_string_counts() {
        let payload = json!({"user": {
            "name": "listener",
            "realname": "",
            "url": "https://www.last.fm/user/listener",
            "country": "NL",
            "registered": {"unixtime": "1262304000", "#text": 1262304000},
            "playcount": "1234",
            "track_count": "500",
            "artist_count": 80,
            "image": [{"#text": "small.png"}, {"#text": "large.png"}]
        }});
        let parsed: UserInfoResponse = serde_json::from_value(payload).unwrap();
        let profile = parsed.user.into_profile();
        assert_eq!(profile.name, "listener");
        assert_eq!(profile.real_name, None);
        assert_eq!(profile.play_count, Some(1234));
        assert_eq!(profile.artist_count, Some(80));
        assert_eq!(profile.album_count, None);
        assert_eq!(profile.image_url.as_deref(), Some("large.png"));
        assert_eq!(
            profile.registered.map(|at| at.timestamp()),
            Some(1_262_304_000)
        );
    }

    #[test]
    fn track_params_skip_empty_optional_fields() {
        let track = TrackMetadata {
            artist: "Artist".to_string(),
            title: "Song".to_string(),
            album: None,
            duration_secs: 0,
        };
        let params = track_params("sk", &track);
        assert!(params.iter().all(|(key, _)| *key != "album" && *key != "duration"));
    }
}
