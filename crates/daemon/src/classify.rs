// tunnelkeep - Error Classifier
// Maps free-text transport failure messages onto coarse error classes

use tunnelkeep_common::ErrorClass;

/// Classify a failure message. Matching is case-insensitive substring
/// search in a fixed priority order; the first match wins, so a message
/// mentioning both "host key" and "network" classifies as HostKey.
pub fn classify(message: Option<&str>) -> ErrorClass {
    let text = message.unwrap_or_default().to_lowercase();
    if text.contains("auth") || text.contains("permission denied") {
        ErrorClass::Auth
    } else if text.contains("host key") || text.contains("known_hosts") {
        ErrorClass::HostKey
    } else if text.contains("unknown host")
        || text.contains("name or service")
        || text.contains("unresolved")
    {
        ErrorClass::Dns
    } else if text.contains("refused") {
        ErrorClass::Refused
    } else if text.contains("timed out") || text.contains("timeout") {
        ErrorClass::Timeout
    } else if text.contains("network") || text.contains("route") {
        ErrorClass::Network
    } else {
        ErrorClass::Unknown
    }
}
