//! Resolve the documents a transport connection subscribes to.
//!
//! Connections name their documents in the query string:
//! `?documents=a,b:encrypted&documents=c`.

const ENCRYPTED_SUFFIX: &str = ":encrypted";
const DOCUMENTS_PARAM: &str = "documents";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSubscription {
    pub document: String,
    pub encrypted: bool,
}

impl DocumentSubscription {
    pub fn new(document: impl Into<String>, encrypted: bool) -> Self {
        Self {
            document: document.into(),
            encrypted,
        }
    }
}

/// Parse `documents` parameter values.
///
/// Each value may hold several comma-separated ids; an id ending in
/// `:encrypted` is marked encrypted. Duplicates collapse to one entry that
/// prefers the encrypted variant, in first-seen order.
pub fn parse_document_subscriptions<'a, I>(params: I) -> Vec<DocumentSubscription>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut resolved: Vec<DocumentSubscription> = Vec::new();

    for param in params {
        for id in param.split(',').map(str::trim).filter(|id| !id.is_empty()) {
            let subscription = match id.strip_suffix(ENCRYPTED_SUFFIX) {
                Some("") => continue,
                Some(name) => DocumentSubscription::new(name, true),
                None => DocumentSubscription::new(id, false),
            };

            match resolved.iter_mut().find(|s| s.document == subscription.document) {
                Some(existing) => existing.encrypted |= subscription.encrypted,
                None => resolved.push(subscription),
            }
        }
    }

    resolved
}

/// Extract and parse every `documents` parameter of a raw query string.
pub fn documents_from_query(query: &str) -> Vec<DocumentSubscription> {
    let values: Vec<String> = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| *key == DOCUMENTS_PARAM)
        .map(|(_, value)| value.into_owned())
        .collect();
    parse_document_subscriptions(values.iter().map(String::as_str))
}
