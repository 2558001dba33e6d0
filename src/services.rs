//! Built-in service catalog
//!
//! Each service bundles the hostnames and published address ranges a
//! third-party product needs. Only `enabled` is user-controlled; everything
//! else comes from here on every load.

use crate::config::ServiceEntry;
use ipnet::IpNet;

struct CatalogEntry {
    id: &'static str,
    name: &'static str,
    domains: &'static [&'static str],
    ip_ranges: &'static [&'static str],
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        id: "telegram",
        name: "Telegram",
        domains: &["telegram.org", "web.telegram.org", "t.me", "core.telegram.org"],
        ip_ranges: &[
            "91.108.4.0/22",
            "91.108.8.0/22",
            "91.108.12.0/22",
            "91.108.16.0/22",
            "91.108.20.0/22",
            "91.108.56.0/22",
            "149.154.160.0/20",
            "185.76.151.0/24",
        ],
    },
    CatalogEntry {
        id: "youtube",
        name: "YouTube",
        domains: &[
            "youtube.com",
            "www.youtube.com",
            "m.youtube.com",
            "youtu.be",
            "i.ytimg.com",
            "yt3.ggpht.com",
        ],
        ip_ranges: &[],
    },
    CatalogEntry {
        id: "whatsapp",
        name: "WhatsApp",
        domains: &["whatsapp.com", "web.whatsapp.com", "whatsapp.net", "g.whatsapp.net"],
        ip_ranges: &[],
    },
    CatalogEntry {
        id: "spotify",
        name: "Spotify",
        domains: &[
            "spotify.com",
            "open.spotify.com",
            "api.spotify.com",
            "accounts.spotify.com",
            "spclient.wg.spotify.com",
        ],
        ip_ranges: &[],
    },
    CatalogEntry {
        id: "tailscale",
        name: "Tailscale",
        domains: &[
            "controlplane.tailscale.com",
            "login.tailscale.com",
            "log.tailscale.io",
        ],
        ip_ranges: &["100.64.0.0/10"],
    },
    CatalogEntry {
        id: "slack",
        name: "Slack",
        domains: &[
            "slack.com",
            "app.slack.com",
            "files.slack.com",
            "wss-primary.slack.com",
            "edgeapi.slack.com",
        ],
        ip_ranges: &[],
    },
    CatalogEntry {
        id: "discord",
        name: "Discord",
        domains: &[
            "discord.com",
            "discord.gg",
            "gateway.discord.gg",
            "cdn.discordapp.com",
            "media.discordapp.net",
        ],
        ip_ranges: &[],
    },
    CatalogEntry {
        id: "twitch",
        name: "Twitch",
        domains: &[
            "twitch.tv",
            "www.twitch.tv",
            "gql.twitch.tv",
            "static.twitchcdn.net",
            "usher.ttvnw.net",
        ],
        ip_ranges: &[],
    },
];

/// All catalog services, disabled
pub fn catalog() -> Vec<ServiceEntry> {
    CATALOG.iter().map(to_entry).collect()
}

/// Whether `id` names a catalog service
pub fn is_known(id: &str) -> bool {
    CATALOG.iter().any(|entry| entry.id == id)
}

fn to_entry(entry: &CatalogEntry) -> ServiceEntry {
    ServiceEntry {
        id: entry.id.to_string(),
        name: entry.name.to_string(),
        domains: entry.domains.iter().map(|d| d.to_string()).collect(),
        // Catalog literals are checked by test_catalog_ranges_parse
        ip_ranges: entry
            .ip_ranges
            .iter()
            .filter_map(|r| r.parse::<IpNet>().ok())
            .collect(),
        enabled: false,
    }
}
