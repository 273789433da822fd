//! What a consumer asked for and how it is being served

use std::net::SocketAddr;

use url::Url;

use crate::tag::MediaFormat;

/// Credentials and context handed to an authorizer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizerRequest {
    /// User name
    pub user: String,
    /// Password
    pub passwd: String,
    /// Opaque token (query parameter or cookie)
    pub token: String,
    /// Remote address of the client
    pub net_address: String,
    /// Resource being accessed (the media path)
    pub resource: String,
    /// Action being performed (`"play"`, `"publish"`)
    pub action: String,
    /// How long the action has been going on, for reauthorization
    pub action_performed_ms: i64,
}

/// Consumer-side request parameters
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Request path, without query
    pub path: String,
    /// Initial seek position
    pub seek_pos_ms: i64,
    /// Media origin offset
    pub media_origin_pos_ms: i64,
    /// Stop serving after this much media, if set
    pub limit_ms: Option<i64>,
    /// Session id
    pub session_id: String,
    /// Affiliate id
    pub affiliate_id: String,
    /// Client id
    pub client_id: String,
    /// Client user agent
    pub user_agent: String,
    /// Remote peer
    pub remote_address: Option<SocketAddr>,
    /// Local endpoint the request came in on
    pub local_address: Option<SocketAddr>,
    /// Requested flavour mask, if any
    pub flavour_mask: Option<u32>,
    /// Credentials
    pub auth_req: AuthorizerRequest,
    /// Set for requests created by elements on their own behalf
    pub is_internal: bool,
}

impl RequestInfo {
    /// Fill the info from a request URL
    ///
    /// Unknown parameters are ignored and malformed numbers leave the
    /// defaults in place.
    pub fn from_url(url: &Url) -> Self {
        let mut info = RequestInfo {
            path: url.path().to_string(),
            ..Default::default()
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "wsp" => parse_into(&value, &mut info.seek_pos_ms),
                "wmo" => parse_into(&value, &mut info.media_origin_pos_ms),
                "wl" => info.limit_ms = value.parse().ok().or(info.limit_ms),
                "wsi" => info.session_id = value.into_owned(),
                "wai" => info.affiliate_id = value.into_owned(),
                "wci" => info.client_id = value.into_owned(),
                "wuname" => info.auth_req.user = value.into_owned(),
                "wword" => info.auth_req.passwd = value.into_owned(),
                "wtoken" => info.auth_req.token = value.into_owned(),
                "wfl" => info.flavour_mask = value.parse().ok().or(info.flavour_mask),
                _ => {}
            }
        }
        info
    }

    /// `<session>/<affiliate>/<client>` with `unset` placeholders
    pub fn path_id(&self) -> String {
        fn or_unset(s: &str) -> &str {
            if s.is_empty() {
                "unset"
            } else {
                s
            }
        }
        format!(
            "{}/{}/{}",
            or_unset(&self.session_id),
            or_unset(&self.affiliate_id),
            or_unset(&self.client_id)
        )
    }
}

fn parse_into(value: &str, slot: &mut i64) {
    if let Ok(v) = value.parse() {
        *slot = v;
    }
}

/// How a request is currently being served, filled by export resolution
#[derive(Debug, Clone, Default)]
pub struct RequestServingInfo {
    /// Export the request resolved through
    pub export_path: String,
    /// Media name handed to the element
    pub media_name: String,
    /// Forced format for the reply, if any
    pub format: Option<MediaFormat>,
    /// Forced HTTP content type, if any
    pub content_type: Option<String>,
    /// Extra reply headers
    pub extra_headers: Vec<(String, String)>,
    /// Authorizer to consult, empty for none
    pub authorizer_name: String,
    /// Client cap on the export, `None` for unlimited
    pub max_clients: Option<u32>,
    /// Flavour mask forced by the export
    pub flavour_mask: Option<u32>,
    /// Drop droppable media when this much is queued (0 disables)
    pub flow_control_total_ms: i64,
    /// Drop droppable video when this much is queued (0 disables)
    pub flow_control_video_ms: i64,
    /// Byte offset into the media
    pub offset: Option<u64>,
    /// Byte size of the media
    pub size: Option<u64>,
}
