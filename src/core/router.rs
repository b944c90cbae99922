use crate::config::ServiceConfig;

/// Dispatches request paths to configured services by longest prefix match
pub struct ServiceRouter {
    /// Services sorted by prefix length, longest first
    services: Vec<ServiceConfig>,
}

impl ServiceRouter {
    pub fn new(mut services: Vec<ServiceConfig>) -> Self {
        services.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { services }
    }

    /// Find the service whose prefix matches `path`.
    ///
    /// A prefix matches exactly or at a path-segment boundary, so `/users`
    /// captures `/users` and `/users/42` but not `/users-admin`.
    pub fn find(&self, path: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|service| {
            path == service.prefix
                || path
                    .strip_prefix(service.prefix.as_str())
                    .map(|rest| rest.starts_with('/'))
                    .unwrap_or(false)
        })
    }

    pub fn services(&self) -> &[ServiceConfig] {
        &self.services
    }
}
