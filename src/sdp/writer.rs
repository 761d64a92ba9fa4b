//! [`SessionDescription`] to SDP text.

use super::{Content, Parameter, Role, SessionDescription};
use std::fmt::Write;

const CRLF: &str = "\r\n";

/// Serialize `description` with `sid` in the origin line, writing direction
/// attributes from the point of view of `author`.
///
/// The output is canonical: parsing it back with the same author yields
/// `description` unchanged and serializing that result reproduces the same
/// text.
pub fn serialize(description: &SessionDescription, sid: &str, author: Role) -> String {
    let mut out = String::new();
    push(&mut out, "v=0");
    push(&mut out, &format!("o=- {} 2 IN IP4 0.0.0.0", sid));
    push(&mut out, "s=-");
    push(&mut out, "t=0 0");

    if let Some(bundle) = &description.bundle {
        let mut line = String::from("a=group:BUNDLE");
        for name in bundle {
            line.push(' ');
            line.push_str(name);
        }
        push(&mut out, &line);
    }

    for content in &description.contents {
        write_content(&mut out, content, author);
    }
    out
}

fn push(out: &mut String, line: &str) {
    out.push_str(line);
    out.push_str(CRLF);
}

fn write_content(out: &mut String, content: &Content, author: Role) {
    let desc = &content.description;

    let protocol = desc.protocol.as_deref().unwrap_or("UDP/TLS/RTP/SAVPF");
    let mut m_line = format!("m={} 9 {}", desc.media, protocol);
    for payload in &desc.payloads {
        let _ = write!(m_line, " {}", payload.id);
    }
    for format in &desc.formats {
        let _ = write!(m_line, " {}", format);
    }
    push(out, &m_line);
    push(out, "c=IN IP4 0.0.0.0");
    push(out, "a=rtcp:9 IN IP4 0.0.0.0");

    if let Some(transport) = &content.transport {
        if let Some(ufrag) = &transport.ufrag {
            push(out, &format!("a=ice-ufrag:{}", ufrag));
        }
        if let Some(pwd) = &transport.pwd {
            push(out, &format!("a=ice-pwd:{}", pwd));
        }
        if let Some(fingerprint) = &transport.fingerprint {
            push(
                out,
                &format!("a=fingerprint:{} {}", fingerprint.hash, fingerprint.value),
            );
        }
        if let Some(setup) = &transport.setup {
            push(out, &format!("a=setup:{}", setup));
        }
    }

    push(out, &format!("a=mid:{}", content.name));
    for ext in &desc.header_extensions {
        push(out, &format!("a=extmap:{} {}", ext.id, ext.uri));
    }
    push(out, &format!("a={}", content.senders.to_direction(author)));
    if desc.rtcp_mux {
        push(out, "a=rtcp-mux");
    }

    for payload in &desc.payloads {
        if let (Some(name), Some(clockrate)) = (&payload.name, payload.clockrate) {
            let mut line = format!("a=rtpmap:{} {}/{}", payload.id, name, clockrate);
            if payload.channels > 1 {
                let _ = write!(line, "/{}", payload.channels);
            }
            push(out, &line);
        }
        for fb in &payload.feedback {
            match &fb.subtype {
                Some(subtype) => push(
                    out,
                    &format!("a=rtcp-fb:{} {} {}", payload.id, fb.kind, subtype),
                ),
                None => push(out, &format!("a=rtcp-fb:{} {}", payload.id, fb.kind)),
            }
        }
        if !payload.parameters.is_empty() {
            push(
                out,
                &format!(
                    "a=fmtp:{} {}",
                    payload.id,
                    format_parameters(&payload.parameters)
                ),
            );
        }
    }

    for group in &desc.source_groups {
        let mut line = format!("a=ssrc-group:{}", group.semantics);
        for ssrc in &group.sources {
            let _ = write!(line, " {}", ssrc);
        }
        push(out, &line);
    }
    for source in &desc.sources {
        if source.parameters.is_empty() {
            push(out, &format!("a=ssrc:{}", source.ssrc));
        }
        for param in &source.parameters {
            push(
                out,
                &format!("a=ssrc:{} {}:{}", source.ssrc, param.name, param.value),
            );
        }
    }

    if let Some(transport) = &content.transport {
        for candidate in &transport.candidates {
            push(out, &candidate.to_attribute());
        }
    }
}

fn format_parameters(parameters: &[Parameter]) -> String {
    parameters
        .iter()
        .map(|p| {
            if p.name.is_empty() {
                p.value.clone()
            } else {
                format!("{}={}", p.name, p.value)
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}
