//! M3U channel list writer

use super::Service;

/// Render the extended-M3U channel list. Entries point at the receiver's
/// stream port; IPTV clients pull the raw transport stream directly.
pub fn render(services: &[Service], stream_host: &str, stream_port: u16) -> String {
    let mut out = String::from("#EXTM3U\n");
    for service in services {
        let tvg_id = tvg_id(&service.service_ref);
        out.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{}\" tvg-name=\"{}\",{}\n",
            tvg_id,
            service.name.replace('"', "'"),
            service.name
        ));
        out.push_str(&format!(
            "http://{}:{}/{}\n",
            stream_host, stream_port, service.service_ref
        ));
    }
    out
}

/// Stable XMLTV channel id derived from a service reference: the reference
/// with separators flattened, matching what the guide writer emits.
pub fn tvg_id(service_ref: &str) -> String {
    service_ref.trim_end_matches(':').replace(':', ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(service_ref: &str, name: &str) -> Service {
        Service {
            service_ref: service_ref.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn renders_extinf_entries_with_stream_urls() {
        let services = vec![
            service("1:0:19:EF75:3F9:1:C00000:0:0:0:", "Das Erste HD"),
            service("1:0:19:EF76:3F9:1:C00000:0:0:0:", "ZDF HD"),
        ];
        let m3u = render(&services, "receiver.local", 8001);
        let lines: Vec<&str> = m3u.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert!(lines[1].starts_with("#EXTINF:-1 tvg-id=\"1.0.19.EF75.3F9.1.C00000.0.0.0\""));
        assert!(lines[1].ends_with(",Das Erste HD"));
        assert_eq!(
            lines[2],
            "http://receiver.local:8001/1:0:19:EF75:3F9:1:C00000:0:0:0:"
        );
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn tvg_id_flattens_separators() {
        assert_eq!(
            tvg_id("1:0:19:EF75:3F9:1:C00000:0:0:0:"),
            "1.0.19.EF75.3F9.1.C00000.0.0.0"
        );
    }
}
