/// Pick the credential from an `Authorization` header value or a `token`
/// query parameter. The header wins when both are present.
pub fn bearer_from_parts<'a>(
    authorization: Option<&'a str>,
    query_token: Option<&'a str>,
) -> Option<&'a str> {
    let from_header = authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    from_header.or_else(|| query_token.map(str::trim).filter(|t| !t.is_empty()))
}
