//! XMLTV guide writer
//!
//! Renders channels and now/next programmes into XMLTV via quick-xml's
//! serde support.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::m3u::tvg_id;
use super::{EpgEvent, Service};
use crate::errors::AppError;

#[derive(Debug, Serialize)]
#[serde(rename = "tv")]
struct Tv {
    #[serde(rename = "@generator-info-name")]
    generator: String,
    channel: Vec<Channel>,
    programme: Vec<Programme>,
}

#[derive(Debug, Serialize)]
struct Channel {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "display-name")]
    display_name: String,
}

#[derive(Debug, Serialize)]
struct Programme {
    #[serde(rename = "@start")]
    start: String,
    #[serde(rename = "@stop")]
    stop: String,
    #[serde(rename = "@channel")]
    channel: String,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    desc: Option<String>,
}

fn xmltv_time(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or_else(Utc::now)
        .format("%Y%m%d%H%M%S +0000")
        .to_string()
}

pub fn render(services: &[Service], events: &[EpgEvent]) -> Result<String, AppError> {
    let channels = services
        .iter()
        .map(|s| Channel {
            id: tvg_id(&s.service_ref),
            display_name: s.name.clone(),
        })
        .collect();

    let programmes = events
        .iter()
        .filter(|e| !e.title.is_empty() && e.duration > 0)
        .map(|e| Programme {
            start: xmltv_time(e.begin),
            stop: xmltv_time(e.begin + e.duration),
            channel: tvg_id(&e.service_ref),
            title: e.title.clone(),
            desc: e.short_desc.clone().filter(|d| !d.is_empty()),
        })
        .collect();

    let tv = Tv {
        generator: format!("xg2g/{}", env!("CARGO_PKG_VERSION")),
        channel: channels,
        programme: programmes,
    };

    let body = quick_xml::se::to_string(&tv)
        .map_err(|e| AppError::internal(format!("xmltv serialization failed: {e}")))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body}\n"))
}
