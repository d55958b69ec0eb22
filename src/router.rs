// src/router.rs
//! Pre-resolution routing. Before a target hits the filesystem it passes
//! through this table: single-character marker paths alias fixed pages, and
//! the form markers divert POST bodies into the credential handler. The
//! table is data, not code, so deployments can remap it.

use std::collections::HashMap;

/// What a parsed target resolves to before filesystem resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Serve this path (possibly rewritten) from the document root.
    Page(String),
    /// Credential check against the backing store.
    Login,
    /// Credential registration in the backing store.
    Register,
}

pub struct RouteTable {
    aliases: HashMap<char, String>,
    login_marker: char,
    register_marker: char,
}

impl RouteTable {
    /// The conventional table: numeric markers alias the fixed site pages,
    /// '2' submits a login form and '3' a registration form.
    pub fn standard() -> Self {
        let mut aliases = HashMap::new();
        aliases.insert('0', "/register.html".to_string());
        aliases.insert('1', "/log.html".to_string());
        aliases.insert('5', "/picture.html".to_string());
        aliases.insert('6', "/video.html".to_string());
        aliases.insert('7', "/fans.html".to_string());
        Self {
            aliases,
            login_marker: '2',
            register_marker: '3',
        }
    }

    pub fn alias(mut self, marker: char, page: &str) -> Self {
        self.aliases.insert(marker, page.to_string());
        self
    }

    /// Routes a target path. `has_body` gates the form markers: a GET for
    /// the login marker is just a (failing) static lookup, as in the
    /// original convention.
    pub fn route(&self, path: &str, has_body: bool) -> RouteAction {
        let marker = path
            .rfind('/')
            .and_then(|i| path[i + 1..].chars().next());
        match marker {
            Some(m) if has_body && m == self.login_marker => RouteAction::Login,
            Some(m) if has_body && m == self.register_marker => RouteAction::Register,
            Some(m) => match self.aliases.get(&m) {
                Some(page) => RouteAction::Page(page.clone()),
                None => RouteAction::Page(path.to_string()),
            },
            None => RouteAction::Page(path.to_string()),
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_aliases_rewrite() {
        let table = RouteTable::standard();
        assert_eq!(
            table.route("/0", false),
            RouteAction::Page("/register.html".into())
        );
        assert_eq!(table.route("/1", false), RouteAction::Page("/log.html".into()));
        assert_eq!(
            table.route("/5", false),
            RouteAction::Page("/picture.html".into())
        );
    }

    #[test]
    fn form_markers_need_a_body() {
        let table = RouteTable::standard();
        assert_eq!(table.route("/2", true), RouteAction::Login);
        assert_eq!(table.route("/3", true), RouteAction::Register);
        // Without a body the markers fall through to static resolution.
        assert_eq!(table.route("/2", false), RouteAction::Page("/2".into()));
    }

    #[test]
    fn plain_paths_pass_through() {
        let table = RouteTable::standard();
        assert_eq!(
            table.route("/judge.html", false),
            RouteAction::Page("/judge.html".into())
        );
        assert_eq!(
            table.route("/assets/pic.jpg", true),
            RouteAction::Page("/assets/pic.jpg".into())
        );
    }

    #[test]
    fn custom_alias() {
        let table = RouteTable::standard().alias('9', "/stats.html");
        assert_eq!(table.route("/9", false), RouteAction::Page("/stats.html".into()));
    }
}
