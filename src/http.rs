// src/http.rs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Parses a request-line method token. Only GET and POST are served;
    /// anything else is a malformed request as far as this engine is
    /// concerned. Matching is case-insensitive like the rest of the parser.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        if token.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case(b"POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

pub const STATUS_200_TITLE: &str = "OK";
pub const STATUS_400_TITLE: &str = "Bad Request";
pub const STATUS_403_TITLE: &str = "Forbidden";
pub const STATUS_404_TITLE: &str = "Not Found";
pub const STATUS_500_TITLE: &str = "Internal Server Error";

pub const STATUS_400_FORM: &str = "Your request has a syntax error";
pub const STATUS_403_FORM: &str = "Your request was rejected by the server";
pub const STATUS_404_FORM: &str = "The requested resource could not be found on the server";
pub const STATUS_500_FORM: &str = "The server encountered an error while executing the request";

/// Body substituted when a mapped resource turns out to be zero bytes long.
pub const EMPTY_FILE_BODY: &str = "<html><body></body></html>";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tokens() {
        assert_eq!(Method::from_token(b"GET"), Some(Method::Get));
        assert_eq!(Method::from_token(b"post"), Some(Method::Post));
        assert_eq!(Method::from_token(b"PUT"), None);
        assert_eq!(Method::from_token(b""), None);
    }
}
