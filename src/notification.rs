//! Push notification pass-through.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CacheError, Result};

const DEFAULT_TITLE: &str = "AgriMarket";
const DEFAULT_BODY: &str = "New updates are available in the marketplace";
const DEFAULT_ICON: &str = "/icons/icon-192x192.png";
const DEFAULT_TARGET: &str = "/marketplace";

pub const ACTION_EXPLORE: &str = "explore";
pub const ACTION_CLOSE: &str = "close";

/// Fields a push message may carry. Missing fields fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub icon: Option<String>,
  pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: &'static str,
  pub title: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  /// Opened when the notification is explored
  pub target: Url,
  pub actions: [NotificationAction; 2],
}

/// What the host should do after a click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickEffect {
  Open(Url),
  Dismiss,
}

impl Notification {
  /// Build a notification from a raw push message. An empty or non-JSON
  /// message is shown with the default text.
  pub fn from_push(origin: &Url, payload: Option<&[u8]>) -> Result<Self> {
    let payload: PushPayload = payload
      .and_then(|bytes| serde_json::from_slice(bytes).ok())
      .unwrap_or_default();

    let target_input = payload.url.as_deref().unwrap_or(DEFAULT_TARGET);
    let target = origin
      .join(target_input)
      .map_err(|source| CacheError::InvalidUrl {
        input: target_input.to_string(),
        source,
      })?;

    Ok(Self {
      title: payload.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
      body: payload.body.unwrap_or_else(|| DEFAULT_BODY.to_string()),
      icon: payload.icon.unwrap_or_else(|| DEFAULT_ICON.to_string()),
      target,
      actions: [
        NotificationAction {
          action: ACTION_EXPLORE,
          title: "Explore",
        },
        NotificationAction {
          action: ACTION_CLOSE,
          title: "Close",
        },
      ],
    })
  }

  /// `None` is a click on the notification body.
  pub fn on_click(&self, action: Option<&str>) -> ClickEffect {
    match action {
      Some(ACTION_CLOSE) => ClickEffect::Dismiss,
      _ => ClickEffect::Open(self.target.clone()),
    }
  }
}
