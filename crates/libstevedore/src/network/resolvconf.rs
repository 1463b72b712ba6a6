use std::net::IpAddr;

/// The parts of a `resolv.conf` that containers can override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    pub nameservers: Vec<String>,
    pub search: Vec<String>,
    pub options: Vec<String>,
}

impl ResolvConf {
    pub fn parse(content: &str) -> Self {
        let mut conf = Self::default();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => conf.nameservers.extend(fields.next().map(str::to_owned)),
                Some("search") | Some("domain") => {
                    conf.search = fields.map(str::to_owned).collect();
                }
                Some("options") => conf.options.extend(fields.map(str::to_owned)),
                _ => {}
            }
        }
        conf
    }

    /// Drops loopback name servers, which are unreachable from a private
    /// network namespace.
    pub fn without_loopback(mut self) -> Self {
        self.nameservers.retain(|ns| {
            ns.parse::<IpAddr>()
                .map(|ip| !ip.is_loopback())
                .unwrap_or(true)
        });
        self
    }

    /// Replaces each non-empty override list.
    pub fn with_overrides(
        mut self,
        nameservers: &[String],
        search: &[String],
        options: &[String],
    ) -> Self {
        if !nameservers.is_empty() {
            self.nameservers = nameservers.to_vec();
        }
        if !search.is_empty() {
            self.search = search.to_vec();
        }
        if !options.is_empty() {
            self.options = options.to_vec();
        }
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for ns in &self.nameservers {
            out.push_str(&format!("nameserver {ns}\n"));
        }
        if !self.search.is_empty() {
            out.push_str(&format!("search {}\n", self.search.join(" ")));
        }
        if !self.options.is_empty() {
            out.push_str(&format!("options {}\n", self.options.join(" ")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str =
        "# generated\nnameserver 127.0.0.53\nnameserver 10.0.0.1\nsearch lan corp\noptions edns0\n";

    #[test]
    fn test_parse_and_render() {
        let conf = ResolvConf::parse(HOST);
        assert_eq!(conf.nameservers, vec!["127.0.0.53", "10.0.0.1"]);
        assert_eq!(conf.search, vec!["lan", "corp"]);
        assert_eq!(conf.options, vec!["edns0"]);

        let rendered = conf.without_loopback().render();
        assert_eq!(
            rendered,
            "nameserver 10.0.0.1\nsearch lan corp\noptions edns0\n"
        );
    }

    #[test]
    fn test_overrides() {
        let conf = ResolvConf::parse(HOST).with_overrides(
            &["1.1.1.1".to_owned()],
            &[],
            &["ndots:2".to_owned()],
        );
        assert_eq!(conf.nameservers, vec!["1.1.1.1"]);
        assert_eq!(conf.search, vec!["lan", "corp"]);
        assert_eq!(conf.options, vec!["ndots:2"]);
    }
}
