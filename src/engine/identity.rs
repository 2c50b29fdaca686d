//! Per-iteration simulated user identity: source IP, User-Agent, and an
//! ambient header profile.
use rand::Rng;
use rand::seq::SliceRandom;
use rand::thread_rng;

const USER_AGENTS_WEB: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 12_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.6 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:102.0) Gecko/20100101 Firefox/102.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/606.1.15 (KHTML, like Gecko) Version/15.6 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.0.0 Safari/537.36 Edg/116.0.1938.69",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.5 Safari/605.1.15",
    "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv=109.0) Gecko/20100101 Firefox/115.0",
];

const USER_AGENTS_API: &[&str] = &[
    "PostmanRuntime/7.29.0",
    "Python-requests/2.27.1",
    "curl/7.79.1",
    "Go-http-client/1.1",
    "Apache-HttpClient/4.5.13 (Java/11.0.15)",
    "axios/0.21.1 Node.js/v14.17.0",
    "okhttp/4.9.1",
    "HTTPie/2.5.0",
];

const HEADER_PROFILES_WEB: &[&[(&str, &str)]] = &[
    &[
        ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        ("Accept-Language", "en-US,en;q=0.5"),
        ("Connection", "keep-alive"),
        ("Upgrade-Insecure-Requests", "1"),
        ("DNT", "1"),
    ],
    &[
        ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
        ("Accept-Language", "de-DE,de;q=0.5"),
        ("Connection", "keep-alive"),
        ("Pragma", "no-cache"),
        ("Sec-Fetch-Mode", "navigate"),
    ],
    &[
        ("Accept", "text/html,application/xhtml+xml"),
        ("Accept-Language", "fr-FR,fr;q=0.5"),
        ("Connection", "keep-alive"),
        ("Cache-Control", "no-cache"),
    ],
    &[
        ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9"),
        ("Accept-Language", "ja-JP,ja;q=0.5"),
        ("Connection", "keep-alive"),
        ("Upgrade-Insecure-Requests", "1"),
        ("Sec-Fetch-Dest", "document"),
    ],
];

const HEADER_PROFILES_API: &[&[(&str, &str)]] = &[
    &[
        ("Accept", "application/json"),
        ("Connection", "keep-alive"),
        ("Accept-Encoding", "gzip, deflate, br"),
        ("Cache-Control", "no-cache"),
    ],
    &[
        ("Accept", "application/json, text/plain, */*"),
        ("Connection", "keep-alive"),
        ("Accept-Encoding", "gzip, deflate, br"),
    ],
    &[
        ("Accept", "*/*"),
        ("Connection", "keep-alive"),
        ("Accept-Encoding", "gzip, deflate"),
        ("X-Requested-With", "XMLHttpRequest"),
    ],
    &[
        ("Accept", "application/vnd.api+json"),
        ("Connection", "keep-alive"),
        ("X-API-Version", "2.0"),
        ("Accept-Encoding", "gzip, deflate, br"),
    ],
];

const FALLBACK_USER_AGENT: &str = "FlowRunner/1.0";

/// One iteration's simulated client identity.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub source_ip: String,
    pub user_agent: String,
    profile_headers: &'static [(&'static str, &'static str)],
}

impl UserIdentity {
    /// Picks a web-like or API-like profile with matching User-Agent and a
    /// fresh random source IP.
    #[must_use]
    pub fn random() -> Self {
        let mut rng = thread_rng();
        let web_like = rng.gen_bool(0.5);
        let (agents, profiles) = if web_like {
            (USER_AGENTS_WEB, HEADER_PROFILES_WEB)
        } else {
            (USER_AGENTS_API, HEADER_PROFILES_API)
        };
        let user_agent = agents.choose(&mut rng).copied().unwrap_or(FALLBACK_USER_AGENT);
        let profile_headers = profiles.choose(&mut rng).copied().unwrap_or(&[]);

        Self {
            source_ip: random_public_ipv4(),
            user_agent: user_agent.to_owned(),
            profile_headers,
        }
    }

    /// Session-default headers for this identity: the profile headers plus
    /// the User-Agent. The spoofed source IP is injected separately by the
    /// request executor under the configured header name.
    #[must_use]
    pub fn session_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .profile_headers
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();
        headers.push(("User-Agent".to_owned(), self.user_agent.clone()));
        headers
    }
}

/// Generates a plausible public IPv4 address, skipping private, loopback,
/// link-local, CGN, documentation, benchmark, and relay ranges.
#[must_use]
pub fn random_public_ipv4() -> String {
    let mut rng = thread_rng();
    loop {
        let octets = [
            rng.gen_range(1..=223_u8),
            rng.gen_range(0..=255_u8),
            rng.gen_range(0..=255_u8),
            rng.gen_range(0..=255_u8),
        ];
        if is_reserved(octets) {
            continue;
        }
        return format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
    }
}

fn is_reserved(octets: [u8; 4]) -> bool {
    match octets {
        [10, ..] | [127, ..] | [0, ..] => true,
        [172, second, ..] if (16..=31).contains(&second) => true,
        [192, 168, ..] => true,
        [100, second, ..] if (64..=127).contains(&second) => true,
        [169, 254, ..] => true,
        [192, 0, 0 | 2, _] => true,
        [192, 88, 99, _] => true,
        [198, 18 | 19, ..] => true,
        [198, 51, 100, _] => true,
        [203, 0, 113, _] => true,
        _ => false,
    }
}
