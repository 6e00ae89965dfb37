use url::{Host, Url};

use super::error::PlatformError;

/// A URL split into the host and domain parts of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUrl {
    pub host: String,
    pub domain: String,
}

impl RouteUrl {
    /// Parse `[scheme://][user@]host.domain[:port][/path]`; the first label is the host.
    pub fn parse(url: &str) -> Result<Self, PlatformError> {
        let invalid = || PlatformError::Validation(format!("invalid route url {url}"));
        let parsed = if url.contains("://") {
            Url::parse(url)
        } else {
            Url::parse(&format!("http://{url}"))
        }
        .map_err(|_| invalid())?;
        // IP addresses carry no route.
        let hostname = match parsed.host() {
            Some(Host::Domain(hostname)) => hostname.to_ascii_lowercase(),
            _ => return Err(invalid()),
        };
        let (host, domain) = hostname.split_once('.').ok_or_else(invalid)?;
        if host.is_empty() || domain.is_empty() || domain.starts_with('.') || domain.ends_with('.')
        {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_string(),
            domain: domain.to_string(),
        })
    }

    pub fn matches(&self, host: &str, domain: &str) -> bool {
        self.host == host && self.domain == domain
    }
}

impl std::fmt::Display for RouteUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.host, self.domain)
    }
}

/// DNS label for an application name.
pub fn host_for(app_name: &str) -> String {
    app_name.replace('_', "-").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_first_label_as_host() {
        let url = RouteUrl::parse("myapp.example.com").unwrap();
        assert_eq!(url.host, "myapp");
        assert_eq!(url.domain, "example.com");
    }

    #[test]
    fn strips_scheme_port_and_path() {
        let url = RouteUrl::parse("https://api.apps.internal:8443/v1/health?full=1").unwrap();
        assert_eq!(
            url,
            RouteUrl {
                host: "api".into(),
                domain: "apps.internal".into()
            }
        );
        assert_eq!(url.to_string(), "api.apps.internal");
    }

    #[test]
    fn userinfo_is_not_part_of_the_host() {
        let expected = RouteUrl {
            host: "myapp".into(),
            domain: "example.com".into(),
        };
        for url in [
            "http://admin@myapp.example.com/",
            "http://admin:pw@MyApp.example.com/",
            "admin@myapp.example.com",
        ] {
            assert_eq!(RouteUrl::parse(url).unwrap(), expected);
        }
    }

    #[test]
    fn rejects_urls_without_domain() {
        for url in [
            "localhost",
            ".example.com",
            "myapp.",
            "",
            "http:///path",
            "http://10.0.0.1/",
            "http://my app.example.com",
        ] {
            let error = RouteUrl::parse(url).unwrap_err();
            assert_eq!(
                error,
                PlatformError::Validation(format!("invalid route url {url}"))
            );
        }
    }

    #[test]
    fn underscores_become_hyphens() {
        assert_eq!(host_for("my_test_App"), "my-test-app");
    }
}
