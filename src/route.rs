//! Route templates and compiled routes.
//!
//! A [`Route`] is a method plus a slash-delimited path template whose
//! `{name}` placeholders are substituted positionally by [`Route::compile`].
//! The compiled form carries the derived major-parameter key used by the
//! rate limiter to partition buckets: requests with the same template but
//! different major parameter values never share a bucket.
//!
//! # Example
//!
//! ```rust
//! use restflow::route::Route;
//!
//! let route = Route::get("channels/{channel_id}/messages")?;
//! let compiled = route.compile(&["111222333"])?;
//! assert_eq!(compiled.compiled_path(), "channels/111222333/messages");
//! assert_eq!(compiled.major_param_key(), "111222333");
//! # Ok::<(), restflow::RestError>(())
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::RestError;

/// Everything except unreserved characters is percent-encoded.
const ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Placeholder names whose values partition rate-limit buckets.
pub const DEFAULT_MAJOR_PARAMS: &[&str] =
    &["channel_id", "guild_id", "webhook_id", "interaction_token"];

/// Sentinel major-parameter key for routes without major parameters.
pub(crate) const NO_MAJOR_PARAMS: &str = "N/A";

/// HTTP methods supported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Whether the wire protocol requires a request body for this method.
    pub fn requires_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }

    /// The method name as sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A route template identifying a family of API calls that share a
/// rate-limit scope.
#[derive(Debug, Clone)]
pub struct Route {
    method: Method,
    template: String,
    param_count: usize,
    require_auth: bool,
}

impl Route {
    /// Create a route template for the given HTTP method.
    ///
    /// Placeholder segments use the format `{argument_name}`. Rate-limit
    /// handling relies on the correct names of major parameters
    /// (`channel_id`, `guild_id`, `webhook_id`, `interaction_token`).
    ///
    /// Routes require authorization by default; see [`Route::no_auth`].
    pub fn custom(method: Method, template: impl Into<String>) -> Result<Self, RestError> {
        let template = template.into();
        if template.is_empty() {
            return Err(RestError::InvalidArgument("route may not be empty".into()));
        }
        if template.chars().any(char::is_whitespace) {
            return Err(RestError::InvalidArgument(format!(
                "route may not contain whitespace: '{}'",
                template
            )));
        }

        let mut param_count = 0;
        for element in template.split('/') {
            let opening = element.matches('{').count();
            let closing = element.matches('}').count();
            if element.starts_with('{') && element.ends_with('}') {
                // Braces may only appear at the very ends of a segment:
                // valid {guild_id}, invalid {guild_id}abc or {{guild_id}}
                if opening != 1 || closing != 1 || element.len() < 3 {
                    return Err(RestError::InvalidArgument(format!(
                        "route element has invalid syntax: '{}'",
                        element
                    )));
                }
                param_count += 1;
            } else if opening > 0 || closing > 0 {
                return Err(RestError::InvalidArgument(format!(
                    "route element has invalid syntax: '{}'",
                    element
                )));
            }
        }

        Ok(Self {
            method,
            template,
            param_count,
            require_auth: true,
        })
    }

    /// Create a GET route template.
    pub fn get(template: impl Into<String>) -> Result<Self, RestError> {
        Self::custom(Method::Get, template)
    }

    /// Create a POST route template.
    pub fn post(template: impl Into<String>) -> Result<Self, RestError> {
        Self::custom(Method::Post, template)
    }

    /// Create a PUT route template.
    pub fn put(template: impl Into<String>) -> Result<Self, RestError> {
        Self::custom(Method::Put, template)
    }

    /// Create a PATCH route template.
    pub fn patch(template: impl Into<String>) -> Result<Self, RestError> {
        Self::custom(Method::Patch, template)
    }

    /// Create a DELETE route template.
    pub fn delete(template: impl Into<String>) -> Result<Self, RestError> {
        Self::custom(Method::Delete, template)
    }

    /// Mark this route as not requiring the `authorization` header.
    pub fn no_auth(mut self) -> Self {
        self.require_auth = false;
        self
    }

    /// The HTTP method of this template.
    pub fn method(&self) -> Method {
        self.method
    }

    /// The template string with its placeholders.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The number of path parameters, not counting query parameters.
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Whether requests on this route carry the `authorization` header.
    pub fn require_auth(&self) -> bool {
        self.require_auth
    }

    /// Compile the route with positional parameters, using the default
    /// major-parameter set.
    pub fn compile(&self, params: &[&str]) -> Result<CompiledRoute, RestError> {
        self.compile_with_major_params(params, DEFAULT_MAJOR_PARAMS)
    }

    /// Compile the route with positional parameters and a custom
    /// major-parameter name set.
    ///
    /// The number of parameters must match the number of placeholders; the
    /// arguments replace the placeholders in order of appearance and are
    /// percent-encoded. Values substituted for names in `major_params`
    /// form the bucket-partitioning key of the compiled route.
    pub fn compile_with_major_params(
        &self,
        params: &[&str],
        major_params: &[&str],
    ) -> Result<CompiledRoute, RestError> {
        if params.len() != self.param_count {
            return Err(RestError::InvalidArgument(format!(
                "error compiling route [{}]: expected {} parameters, provided {}",
                self, self.param_count, params.len()
            )));
        }

        let mut compiled = Vec::with_capacity(self.template.split('/').count());
        let mut majors = Vec::new();
        let mut param_index = 0;

        for element in self.template.split('/') {
            if element.starts_with('{') {
                let name = &element[1..element.len() - 1];
                let value = params[param_index];
                param_index += 1;
                if major_params.contains(&name) {
                    majors.push(value.to_string());
                }
                compiled.push(utf8_percent_encode(value, ENCODE_SET).to_string());
            } else {
                compiled.push(element.to_string());
            }
        }

        let major_param_key = if majors.is_empty() {
            NO_MAJOR_PARAMS.to_string()
        } else {
            majors.join(":")
        };

        Ok(CompiledRoute {
            base: self.clone(),
            path: compiled.join("/"),
            query: Vec::new(),
            major_param_key,
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.method, self.template)
    }
}

// Equality over (method, template) only; two otherwise identical templates
// share a rate-limit scope regardless of the authorization flag.
impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method && self.template == other.template
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.method.hash(state);
        self.template.hash(state);
    }
}

/// A route compiled with arguments, ready for dispatch.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    base: Route,
    path: String,
    query: Vec<String>,
    major_param_key: String,
}

impl CompiledRoute {
    /// Returns a copy of this route with the provided query parameters added.
    ///
    /// Values are percent-encoded; keys are emitted verbatim. Parameters
    /// append to any existing query list.
    pub fn with_query_params(&self, params: &[(&str, &str)]) -> Result<Self, RestError> {
        if params.is_empty() {
            return Err(RestError::InvalidArgument(
                "at least one query parameter is required".into(),
            ));
        }

        let mut copy = self.clone();
        for (key, value) in params {
            if key.is_empty() {
                return Err(RestError::InvalidArgument("query key may not be empty".into()));
            }
            copy.query
                .push(format!("{}={}", key, utf8_percent_encode(value, ENCODE_SET)));
        }
        Ok(copy)
    }

    /// The full path including query string, relative to the base URL.
    pub fn compiled_path(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query.join("&"))
        }
    }

    /// The route template this was compiled from.
    pub fn base_route(&self) -> &Route {
        &self.base
    }

    /// The HTTP method.
    pub fn method(&self) -> Method {
        self.base.method
    }

    /// The bucket-partitioning key derived from major parameter values.
    pub fn major_param_key(&self) -> &str {
        &self.major_param_key
    }
}

impl fmt::Display for CompiledRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompiledRoute({}: {})", self.base.method, self.path)
    }
}

impl PartialEq for CompiledRoute {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.path == other.path
    }
}

impl Eq for CompiledRoute {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_count() {
        let route = Route::get("channels/{channel_id}/messages/{message_id}").unwrap();
        assert_eq!(route.param_count(), 2);

        let route = Route::get("gateway").unwrap();
        assert_eq!(route.param_count(), 0);
    }

    #[test]
    fn test_compile_arity_mismatch() {
        let route = Route::get("channels/{channel_id}/messages").unwrap();
        assert!(matches!(
            route.compile(&[]),
            Err(RestError::InvalidArgument(_))
        ));
        assert!(matches!(
            route.compile(&["1", "2"]),
            Err(RestError::InvalidArgument(_))
        ));
        assert!(route.compile(&["123"]).is_ok());
    }

    #[test]
    fn test_compile_substitutes_in_order() {
        let route = Route::get("guilds/{guild_id}/members/{user_id}").unwrap();
        let compiled = route.compile(&["42", "7"]).unwrap();
        assert_eq!(compiled.compiled_path(), "guilds/42/members/7");
    }

    #[test]
    fn test_compile_percent_encodes_arguments() {
        let route = Route::get("webhooks/{webhook_id}/{interaction_token}").unwrap();
        let compiled = route.compile(&["99", "a b/c+d"]).unwrap();
        assert_eq!(compiled.compiled_path(), "webhooks/99/a%20b%2Fc%2Bd");
    }

    #[test]
    fn test_major_param_key() {
        let route = Route::get("channels/{channel_id}/messages/{message_id}").unwrap();
        let compiled = route.compile(&["111", "222"]).unwrap();
        // message_id is not a major parameter
        assert_eq!(compiled.major_param_key(), "111");

        let route = Route::get("guilds/{guild_id}/channels/{channel_id}").unwrap();
        let compiled = route.compile(&["1", "2"]).unwrap();
        assert_eq!(compiled.major_param_key(), "1:2");

        let route = Route::get("gateway").unwrap();
        let compiled = route.compile(&[]).unwrap();
        assert_eq!(compiled.major_param_key(), "N/A");
    }

    #[test]
    fn test_custom_major_param_set() {
        let route = Route::get("accounts/{account_id}/orders").unwrap();
        let compiled = route
            .compile_with_major_params(&["abc"], &["account_id"])
            .unwrap();
        assert_eq!(compiled.major_param_key(), "abc");
    }

    #[test]
    fn test_query_params_append_and_encode() {
        let route = Route::get("channels/{channel_id}/messages").unwrap();
        let compiled = route.compile(&["5"]).unwrap();
        let with_limit = compiled.with_query_params(&[("limit", "100")]).unwrap();
        let with_both = with_limit
            .with_query_params(&[("after", "a b")])
            .unwrap();
        assert_eq!(
            with_both.compiled_path(),
            "channels/5/messages?limit=100&after=a%20b"
        );
        // the original is unchanged
        assert_eq!(compiled.compiled_path(), "channels/5/messages");
    }

    #[test]
    fn test_query_params_reject_empty() {
        let compiled = Route::get("gateway").unwrap().compile(&[]).unwrap();
        assert!(compiled.with_query_params(&[]).is_err());
        assert!(compiled.with_query_params(&[("", "v")]).is_err());
    }

    #[test]
    fn test_template_validation() {
        assert!(Route::get("channels/{channel_id}abc/messages").is_err());
        assert!(Route::get("channels/{{channel_id}}/messages").is_err());
        assert!(Route::get("channels/chan{nel/messages").is_err());
        assert!(Route::get("channels/{}/messages").is_err());
        assert!(Route::get("").is_err());
        assert!(Route::get("some route").is_err());
    }

    #[test]
    fn test_route_equality_ignores_auth_flag() {
        let a = Route::get("gateway").unwrap();
        let b = Route::get("gateway").unwrap().no_auth();
        assert_eq!(a, b);

        let c = Route::post("gateway").unwrap();
        assert_ne!(a, c);
    }
}
