// src/core/agents/fingerprinter.rs

use super::{Agent, disguise_headers, http_client};
use crate::core::error::ProbeResult;
use crate::core::events::UrlResponsive;
use crate::core::models::Page;
use crate::core::session::Session;
use color_eyre::eyre::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use scraper::{Html, Selector};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error};

/// Where in a response a pattern is looked for.
#[derive(Debug, Clone, Copy)]
enum Signal {
    /// Value of the named response header.
    Header(&'static str, &'static str),
    /// `content` of `<meta name=...>`.
    Meta(&'static str, &'static str),
    /// Anywhere in the raw body.
    Body(&'static str),
    /// `src` of any `<script>`.
    Script(&'static str),
    /// `href` of any `<link>`.
    Link(&'static str),
    /// Any `set-cookie` value.
    Cookie(&'static str),
}

struct Technology {
    name: &'static str,
    website: &'static str,
    signals: &'static [Signal],
}

use Signal::*;

static TECHNOLOGIES: &[Technology] = &[
    Technology { name: "Nginx", website: "https://nginx.org", signals: &[Header("server", r"nginx"), Body(r"<hr><center>nginx")] },
    Technology { name: "Apache", website: "https://httpd.apache.org", signals: &[Header("server", r"Apache"), Body(r"Apache Server at")] },
    Technology { name: "Microsoft IIS", website: "https://www.iis.net", signals: &[Header("server", r"Microsoft-IIS")] },
    Technology { name: "LiteSpeed", website: "https://www.litespeedtech.com", signals: &[Header("server", r"LiteSpeed")] },
    Technology { name: "Cloudflare", website: "https://www.cloudflare.com", signals: &[Header("server", r"(?i)cloudflare"), Header("cf-ray", r".")] },
    Technology { name: "Varnish", website: "https://varnish-cache.org", signals: &[Header("via", r"varnish"), Header("x-varnish", r".")] },
    Technology { name: "WordPress", website: "https://wordpress.org", signals: &[Meta("generator", r"WordPress"), Body(r"/wp-content/|/wp-includes/"), Body(r"wp-login\.php")] },
    Technology { name: "Joomla", website: "https://www.joomla.org", signals: &[Meta("generator", r"Joomla!")] },
    Technology { name: "Drupal", website: "https://www.drupal.org", signals: &[Meta("generator", r"Drupal"), Header("x-generator", r"Drupal")] },
    Technology { name: "Shopify", website: "https://www.shopify.com", signals: &[Header("x-shopid", r"."), Body(r"cdn\.shopify\.com")] },
    Technology { name: "Magento", website: "https://magento.com", signals: &[Cookie(r"(?i)magento|frontend=")] },
    Technology { name: "PHP", website: "https://php.net", signals: &[Header("x-powered-by", r"PHP"), Cookie(r"PHPSESSID")] },
    Technology { name: "ASP.NET", website: "https://www.asp.net", signals: &[Header("x-aspnet-version", r"."), Header("x-powered-by", r"ASP\.NET"), Cookie(r"ASP\.NET_SessionId")] },
    Technology { name: "Java", website: "https://www.java.com", signals: &[Cookie(r"JSESSIONID")] },
    Technology { name: "Django", website: "https://www.djangoproject.com", signals: &[Cookie(r"csrftoken|django")] },
    Technology { name: "Ruby on Rails", website: "https://rubyonrails.org", signals: &[Cookie(r"_rails_session"), Header("x-powered-by", r"Phusion Passenger")] },
    Technology { name: "Express", website: "https://expressjs.com", signals: &[Header("x-powered-by", r"^Express$")] },
    Technology { name: "Next.js", website: "https://nextjs.org", signals: &[Header("x-powered-by", r"Next\.js"), Script(r"/_next/static/")] },
    Technology { name: "Nuxt.js", website: "https://nuxt.com", signals: &[Body(r"__NUXT__")] },
    Technology { name: "Angular", website: "https://angular.dev", signals: &[Body(r#"ng-version=""#)] },
    Technology { name: "Svelte", website: "https://svelte.dev", signals: &[Body(r#"class=["']svelte-"#)] },
    Technology { name: "Gatsby", website: "https://www.gatsbyjs.com", signals: &[Body(r#"id=["']___gatsby["']"#), Meta("generator", r"Gatsby")] },
    Technology { name: "React", website: "https://react.dev", signals: &[Body(r"react-dom|data-reactroot|react\.development")] },
    Technology { name: "Vue.js", website: "https://vuejs.org", signals: &[Body(r"data-v-app|__VUE_")] },
    Technology { name: "jQuery", website: "https://jquery.com", signals: &[Script(r"jquery[\w.-]*\.js"), Body(r#"\.fn\.jquery"#)] },
    Technology { name: "Bootstrap", website: "https://getbootstrap.com", signals: &[Link(r"bootstrap(\.min)?\.css")] },
    Technology { name: "Google Analytics", website: "https://marketingplatform.google.com/about/analytics/", signals: &[Script(r"google-analytics\.com/|googletagmanager\.com/")] },
];

/// Every signal pattern, compiled once, in table order.
static COMPILED: Lazy<Vec<Vec<Regex>>> = Lazy::new(|| {
    TECHNOLOGIES
        .iter()
        .map(|tech| {
            tech.signals
                .iter()
                .map(|signal| Regex::new(signal.pattern()).expect("invalid fingerprint pattern"))
                .collect()
        })
        .collect()
});

static META: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[name][content]").unwrap());
static SCRIPT_SRC: Lazy<Selector> = Lazy::new(|| Selector::parse("script[src]").unwrap());
static LINK_HREF: Lazy<Selector> = Lazy::new(|| Selector::parse("link[href]").unwrap());

impl Signal {
    fn pattern(&self) -> &'static str {
        match *self {
            Header(_, p) | Meta(_, p) | Body(p) | Script(p) | Link(p) | Cookie(p) => p,
        }
    }
}

/// Parts of a response the signals are matched against.
struct Evidence<'a> {
    headers: &'a HeaderMap,
    body: &'a str,
    cookies: String,
    meta: Vec<(String, String)>,
    scripts: Vec<String>,
    links: Vec<String>,
}

impl<'a> Evidence<'a> {
    fn collect(headers: &'a HeaderMap, body: &'a str) -> Self {
        let document = Html::parse_document(body);
        let meta = document
            .select(&META)
            .filter_map(|el| {
                let name = el.value().attr("name")?.to_ascii_lowercase();
                Some((name, el.value().attr("content")?.to_string()))
            })
            .collect();
        let attrs = |selector: &Selector, attr: &str| -> Vec<String> {
            document
                .select(selector)
                .filter_map(|el| el.value().attr(attr).map(str::to_string))
                .collect()
        };
        let scripts = attrs(&SCRIPT_SRC, "src");
        let links = attrs(&LINK_HREF, "href");
        let cookies = headers
            .get_all("set-cookie")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join("; ");
        Self { headers, body, cookies, meta, scripts, links }
    }

    fn matches(&self, signal: &Signal, re: &Regex) -> bool {
        match *signal {
            Header(name, _) => self
                .headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| re.is_match(v)),
            Meta(name, _) => self.meta.iter().any(|(n, content)| n == name && re.is_match(content)),
            Body(_) => re.is_match(self.body),
            Script(_) => self.scripts.iter().any(|src| re.is_match(src)),
            Link(_) => self.links.iter().any(|href| re.is_match(href)),
            Cookie(_) => re.is_match(&self.cookies),
        }
    }
}

/// Names of the technologies whose signals show up in a response.
pub fn fingerprint(headers: &HeaderMap, body: &str) -> BTreeSet<String> {
    let evidence = Evidence::collect(headers, body);
    TECHNOLOGIES
        .iter()
        .zip(COMPILED.iter())
        .filter(|(tech, patterns)| {
            tech.signals
                .iter()
                .zip(patterns.iter())
                .any(|(signal, re)| evidence.matches(signal, re))
        })
        .map(|(tech, _)| tech.name.to_string())
        .collect()
}

/// Project page of a known technology.
pub fn website(name: &str) -> Option<&'static str> {
    TECHNOLOGIES.iter().find(|t| t.name == name).map(|t| t.website)
}

/// Parses a saved `headers/<base>.txt` back into a header map. The first line
/// is the status line.
pub fn parse_headers_file(contents: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for line in contents.lines().skip(1) {
        let Some((name, value)) = line.split_once(": ") else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            headers.append(name, value);
        }
    }
    headers
}

/// `UrlResponsive` → one `info` tag per identified technology.
pub struct Fingerprinter {
    session: Arc<Session>,
    client: reqwest::Client,
}

impl Agent for Fingerprinter {
    const ID: &'static str = "agent:fingerprinter";

    fn register(session: &Arc<Session>) -> Result<()> {
        let agent = Arc::new(Self {
            session: session.clone(),
            client: http_client(&session.options)?,
        });
        session.bus.subscribe(move |event: UrlResponsive| {
            let agent = agent.clone();
            async move { agent.on_url_responsive(event.url).await }
        });
        Ok(())
    }
}

impl Fingerprinter {
    async fn on_url_responsive(&self, url: String) {
        debug!(agent = Self::ID, %url, "Received new responsive URL.");
        let page = match self.session.require_page(&url) {
            Ok(page) => page,
            Err(e) => {
                error!(agent = Self::ID, %url, error = %e, "Unable to find page.");
                return;
            }
        };

        let _slot = self.session.limiter.acquire().await;
        let (headers, body) = match self.load_response(&page).await {
            Ok(response) => response,
            Err(e) => {
                error!(agent = Self::ID, %url, error = %e, "Unable to load response for fingerprinting.");
                return;
            }
        };

        let technologies = fingerprint(&headers, &body);
        debug!(agent = Self::ID, %url, count = technologies.len(), "Fingerprinted page.");
        for name in &technologies {
            page.add_tag(name, "info", website(name));
        }
    }

    /// Saved headers and body when both were written, otherwise a fresh GET.
    async fn load_response(&self, page: &Page) -> ProbeResult<(HeaderMap, String)> {
        let (headers_path, body_path) = {
            let record = page.lock();
            (record.headers_path.clone(), record.body_path.clone())
        };
        if !body_path.is_empty() {
            let body = tokio::fs::read(self.session.file_path(&body_path)).await?;
            let headers = if headers_path.is_empty() {
                HeaderMap::new()
            } else {
                let raw = tokio::fs::read_to_string(self.session.file_path(&headers_path)).await?;
                parse_headers_file(&raw)
            };
            return Ok((headers, String::from_utf8_lossy(&body).into_owned()));
        }

        let response = self.client.get(page.url()).headers(disguise_headers()).send().await?;
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok((headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::test_session;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_fingerprint_from_headers() {
        let found = fingerprint(
            &headers(&[("server", "nginx/1.25.3"), ("x-powered-by", "PHP/8.2.1"), ("set-cookie", "PHPSESSID=abc; path=/")]),
            "",
        );
        assert_eq!(found, BTreeSet::from(["Nginx".to_string(), "PHP".to_string()]));
    }

    #[test]
    fn test_fingerprint_from_body() {
        let body = r#"<html><head>
            <meta name="generator" content="WordPress 6.4.2">
            <link rel="stylesheet" href="/css/bootstrap.min.css">
            <script src="/js/jquery-3.7.1.min.js"></script>
            </head><body><img src="/wp-content/uploads/a.png"></body></html>"#;
        let found = fingerprint(&HeaderMap::new(), body);
        assert!(found.contains("WordPress"));
        assert!(found.contains("Bootstrap"));
        assert!(found.contains("jQuery"));
        assert!(!found.contains("Nginx"));
    }

    #[test]
    fn test_fingerprint_nothing_known() {
        assert!(fingerprint(&headers(&[("content-type", "text/plain")]), "hello").is_empty());
    }

    #[test]
    fn test_parse_headers_file() {
        let parsed = parse_headers_file("200 OK\nserver: nginx\nset-cookie: a=1\nset-cookie: b=2\nbroken line\nx-empty: \n");
        assert_eq!(parsed["server"], "nginx");
        assert_eq!(parsed.get_all("set-cookie").iter().count(), 2);
        assert_eq!(parsed.len(), 4);
    }

    #[tokio::test]
    async fn test_tags_added_from_saved_response() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(test_session(dir.path()));
        Fingerprinter::register(&session).unwrap();

        let page = session.add_page("http://example.com/").unwrap();
        session.write_file("headers/example.txt", "200 OK\nserver: Apache/2.4.58\n").unwrap();
        session.write_file("html/example.html", "<p>Apache Server at example.com</p>").unwrap();
        {
            let mut record = page.lock();
            record.headers_path = "headers/example.txt".into();
            record.body_path = "html/example.html".into();
        }

        session.bus.publish(UrlResponsive { url: page.url().to_string() });
        session.bus.publish(UrlResponsive { url: page.url().to_string() });
        session.bus.wait_idle().await;

        let tags = page.snapshot().tags;
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].text, "Apache");
        assert_eq!(tags[0].category, "info");
        assert_eq!(tags[0].link.as_deref(), Some("https://httpd.apache.org"));
        session.bus.clear();
    }
}
