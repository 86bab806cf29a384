use tonic::{Request, Status};
use x509_parser::prelude::{FromDer, X509Certificate};

/// A tonic interceptor service function.
///
/// Resolves the peer's mTLS certificate, extracts the Subject Common Name,
/// and stores it in the request extensions as the caller identity. Requests
/// without a client certificate or without a usable CN are rejected as
/// unauthenticated before any handler runs.
pub fn extract_common_name(mut req: Request<()>) -> Result<Request<()>, Status> {
    let certs = req
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("request missing client certificate"))?;
    let der = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("request missing client certificate"))?;

    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|_| Status::unauthenticated("malformed client certificate"))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default();
    if cn.is_empty() {
        return Err(Status::unauthenticated(
            "no valid subject CN found in client certificate",
        ));
    }

    req.extensions_mut().insert(CallerIdentity {
        principal: cn.to_string(),
    });
    Ok(req)
}

/// The authenticated principal, as extracted from the first peer
/// certificate's Subject Common Name.
#[derive(Clone)]
pub struct CallerIdentity {
    pub principal: String,
}
