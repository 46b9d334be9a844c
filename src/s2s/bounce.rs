//! Bounce generator (component G).
//!
//! Invoked from the send path when a stanza's destination pair is not (or
//! no longer) authorized on any session. Produces the appropriate
//! `remote-server-not-found` error response, or suppresses bouncing
//! entirely where the protocol forbids it (responses to IQ responses,
//! stanzas already of type `error`).

use crate::s2s::transport::Packet;
use crate::types::StanzaType;

/// A minimal view of an outgoing stanza, extracted by string inspection
/// rather than full XML parsing (stanza semantics beyond these three kinds
/// are out of scope for this engine).
#[derive(Debug, Clone)]
pub struct OutgoingStanza {
    pub stanza_type: StanzaType,
    pub from: String,
    pub to: String,
    pub id: Option<String>,
    /// `type` attribute on the original stanza (e.g. `get`, `set`, `result`,
    /// `error`, or absent for a plain message/presence).
    pub kind: Option<String>,
    /// `thread` child element text, for messages.
    pub thread: Option<String>,
    /// The original stanza's full XML, for copying the child element into
    /// an IQ error response.
    pub raw_xml: String,
}

/// Decide whether and how to bounce `stanza`. Returns `None` when the
/// protocol forbids a bounce (response-to-response, or already an error).
pub fn build_bounce(stanza: &OutgoingStanza) -> Option<Packet> {
    let packet = match stanza.stanza_type {
        StanzaType::Iq => build_iq_bounce(stanza),
        StanzaType::Presence => build_presence_bounce(stanza),
        StanzaType::Message => build_message_bounce(stanza),
    };
    if packet.is_some() {
        crate::metrics::record_bounce(&stanza.stanza_type.to_string());
    }
    packet
}

fn is_request(kind: Option<&str>) -> bool {
    matches!(kind, Some("get") | Some("set") | None)
}

fn is_error(kind: Option<&str>) -> bool {
    matches!(kind, Some("error"))
}

fn build_iq_bounce(stanza: &OutgoingStanza) -> Option<Packet> {
    if !is_request(stanza.kind.as_deref()) {
        // Responding to a response is forbidden.
        return None;
    }

    let id_attr = stanza
        .id
        .as_deref()
        .map(|id| format!(" id='{}'", id))
        .unwrap_or_default();
    let child = inner_child_xml(&stanza.raw_xml);

    let xml = format!(
        "<iq from='{}' to='{}'{} type='error'>{}{}</iq>",
        stanza.to, stanza.from, id_attr, child, REMOTE_SERVER_NOT_FOUND
    );

    Some(Packet {
        stanza_type: StanzaType::Iq,
        xml,
    })
}

fn build_presence_bounce(stanza: &OutgoingStanza) -> Option<Packet> {
    if is_error(stanza.kind.as_deref()) {
        return None;
    }

    let id_attr = stanza
        .id
        .as_deref()
        .map(|id| format!(" id='{}'", id))
        .unwrap_or_default();

    let xml = format!(
        "<presence from='{}' to='{}'{} type='error'>{}</presence>",
        stanza.to, stanza.from, id_attr, REMOTE_SERVER_NOT_FOUND
    );

    Some(Packet {
        stanza_type: StanzaType::Presence,
        xml,
    })
}

fn build_message_bounce(stanza: &OutgoingStanza) -> Option<Packet> {
    if is_error(stanza.kind.as_deref()) {
        return None;
    }

    let id_attr = stanza
        .id
        .as_deref()
        .map(|id| format!(" id='{}'", id))
        .unwrap_or_default();
    let thread = stanza
        .thread
        .as_deref()
        .map(|t| format!("<thread>{}</thread>", t))
        .unwrap_or_default();

    let xml = format!(
        "<message from='{}' to='{}'{} type='error'>{}{}</message>",
        stanza.to, stanza.from, id_attr, thread, REMOTE_SERVER_NOT_FOUND
    );

    Some(Packet {
        stanza_type: StanzaType::Message,
        xml,
    })
}

const REMOTE_SERVER_NOT_FOUND: &str = "<error type='cancel'><remote-server-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>";

/// Extract the child elements of the outermost stanza element, for IQ
/// error echo (the original request payload is returned inside the
/// error response per RFC 6120 §8.3.3.3).
fn inner_child_xml(raw_xml: &str) -> String {
    let Some(gt) = raw_xml.find('>') else {
        return String::new();
    };
    let open_tag = &raw_xml[..=gt];
    if open_tag.ends_with("/>") {
        return String::new();
    }

    let Some(close_name_start) = raw_xml.rfind("</") else {
        return String::new();
    };

    if gt + 1 >= close_name_start {
        String::new()
    } else {
        raw_xml[gt + 1..close_name_start].to_string()
    }
}
