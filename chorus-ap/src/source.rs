//! Source URI helpers and format negotiation

/// True for `data:<mime>;base64,<payload>` URIs
pub fn is_data_uri(source: &str) -> bool {
    let Some(rest) = source.strip_prefix("data:") else {
        return false;
    };
    match rest.find(',') {
        Some(comma) => {
            let header = &rest[..comma];
            header.ends_with(";base64") && !header.starts_with(';')
        }
        None => false,
    }
}

/// Format name of a source, lowercased
///
/// Data URIs report their `audio/<subtype>` mime subtype; paths and URLs
/// report their file extension (query strings and fragments ignored).
pub fn source_format(source: &str) -> Option<String> {
    if is_data_uri(source) {
        let header = source.strip_prefix("data:")?.split([';', ',']).next()?;
        let (kind, subtype) = header.split_once('/')?;
        if !kind.eq_ignore_ascii_case("audio") || subtype.is_empty() {
            return None;
        }
        return Some(subtype.to_ascii_lowercase());
    }

    let path = source.split(['?', '#']).next()?;
    let file = path.rsplit('/').next()?;
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Pick the source to load from a group's candidates
///
/// With format hints, the first hint the backend supports selects the source
/// at the same index. Without hints, the first source whose format is
/// supported wins.
pub fn compatible_source<F>(sources: &[String], formats: &[String], supports: F) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    if !formats.is_empty() {
        let index = formats.iter().position(|f| supports(&f.to_ascii_lowercase()))?;
        return sources.get(index).cloned();
    }

    sources
        .iter()
        .find(|s| source_format(s).map(|f| supports(&f)).unwrap_or(false))
        .cloned()
}
