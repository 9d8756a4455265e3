use tonic::{Request, Status};

/// Bearer-token check run before every call.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyAuthorizer {
    expected: Option<String>,
}

impl ApiKeyAuthorizer {
    /// With `expected` unset any non-empty token is accepted.
    pub fn new(expected: Option<String>) -> Self {
        Self { expected }
    }

    pub fn authorize(&self, request: Request<()>) -> Result<Request<()>, Status> {
        let header = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization header"))?
            .to_str()
            .map_err(|_| Status::unauthenticated("malformed authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Status::unauthenticated("expected a bearer token"))?;

        if let Some(expected) = &self.expected {
            if token != expected {
                tracing::warn!("Rejected request with unknown API key");
                return Err(Status::unauthenticated("unknown API key"));
            }
        }

        Ok(request)
    }
}
