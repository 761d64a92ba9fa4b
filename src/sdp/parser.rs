//! SDP text to [`SessionDescription`].

use super::{
    Candidate, Content, Fingerprint, HeaderExtension, Parameter, Payload, Role, RtcpFeedback,
    RtpDescription, SdpError, SessionDescription, Senders, Source, SourceGroup, Transport,
};

/// Transport attributes that may appear at session level and apply to every
/// media section that doesn't override them.
#[derive(Default, Clone)]
struct TransportDefaults {
    ufrag: Option<String>,
    pwd: Option<String>,
    fingerprint: Option<(String, String)>,
    setup: Option<String>,
}

struct MediaSection {
    name: Option<String>,
    senders: Senders,
    description: RtpDescription,
    transport: TransportDefaults,
    candidates: Vec<Candidate>,
}

impl MediaSection {
    fn payload_mut(&mut self, id: u8) -> Option<&mut Payload> {
        self.description.payloads.iter_mut().find(|p| p.id == id)
    }

    fn finish(self, index: usize, creator: Role, defaults: &TransportDefaults) -> Content {
        let ufrag = self.transport.ufrag.or_else(|| defaults.ufrag.clone());
        let pwd = self.transport.pwd.or_else(|| defaults.pwd.clone());
        let setup = self.transport.setup.or_else(|| defaults.setup.clone());
        let fingerprint = self
            .transport
            .fingerprint
            .or_else(|| defaults.fingerprint.clone())
            .map(|(hash, value)| Fingerprint { hash, value });

        let transport = Transport {
            ufrag,
            pwd,
            fingerprint,
            setup,
            candidates: self.candidates,
        };

        Content {
            name: self.name.unwrap_or_else(|| index.to_string()),
            creator,
            senders: self.senders,
            description: self.description,
            transport: (!transport.is_empty()).then_some(transport),
        }
    }
}

/// Parse SDP text into a description and its session id.
///
/// Every content is attributed to `creator`. Direction attributes are read
/// from the point of view of `author`, the party that wrote the SDP.
/// Attributes the content model doesn't carry are skipped.
pub fn parse(
    text: &str,
    creator: Role,
    author: Role,
) -> Result<(SessionDescription, String), SdpError> {
    let mut session_id: Option<String> = None;
    let mut bundle: Option<Vec<String>> = None;
    let mut defaults = TransportDefaults::default();
    let mut sections: Vec<MediaSection> = Vec::new();
    let mut saw_line = false;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        saw_line = true;

        let malformed = || SdpError::MalformedLine {
            line: line_no,
            text: line.to_string(),
        };

        let (kind, value) = line.split_once('=').ok_or_else(malformed)?;
        if kind.len() != 1 {
            return Err(malformed());
        }

        match kind {
            "o" => {
                let fields: Vec<&str> = value.split_whitespace().collect();
                if fields.len() < 6 {
                    return Err(malformed());
                }
                session_id = Some(fields[1].to_string());
            }
            "m" => sections.push(parse_media_line(value, line_no, line)?),
            "a" => {
                let (name, arg) = match value.split_once(':') {
                    Some((n, a)) => (n, Some(a.trim())),
                    None => (value, None),
                };
                match sections.last_mut() {
                    Some(section) => {
                        parse_media_attribute(section, name, arg, author).ok_or_else(malformed)?
                    }
                    None => parse_session_attribute(&mut defaults, &mut bundle, name, arg)
                        .ok_or_else(malformed)?,
                }
            }
            _ => {}
        }
    }

    if !saw_line {
        return Err(SdpError::Empty);
    }
    let id = session_id.ok_or(SdpError::MissingSessionId)?;

    let contents = sections
        .into_iter()
        .enumerate()
        .map(|(index, section)| section.finish(index, creator, &defaults))
        .collect();

    Ok((SessionDescription::new(id.clone(), contents, bundle), id))
}

fn parse_media_line(value: &str, line_no: usize, line: &str) -> Result<MediaSection, SdpError> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(SdpError::MalformedLine {
            line: line_no,
            text: line.to_string(),
        });
    }

    // Non-numeric formats mean a non-RTP section; keep it so m-line
    // positions of later contents stay aligned.
    let description = match fields[3..]
        .iter()
        .map(|fmt| fmt.parse::<u8>().map(Payload::new))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(payloads) => RtpDescription {
            media: fields[0].to_string(),
            payloads,
            ..Default::default()
        },
        Err(_) => RtpDescription {
            media: fields[0].to_string(),
            protocol: Some(fields[2].to_string()),
            formats: fields[3..].iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        },
    };

    Ok(MediaSection {
        name: None,
        senders: Senders::Both,
        description,
        transport: TransportDefaults::default(),
        candidates: Vec::new(),
    })
}

/// Returns `None` when a known attribute is malformed.
fn parse_session_attribute(
    defaults: &mut TransportDefaults,
    bundle: &mut Option<Vec<String>>,
    name: &str,
    arg: Option<&str>,
) -> Option<()> {
    match (name, arg) {
        ("group", Some(arg)) => {
            let mut parts = arg.split_whitespace();
            if parts.next()? == "BUNDLE" {
                *bundle = Some(parts.map(str::to_string).collect());
            }
        }
        ("ice-ufrag", Some(arg)) => defaults.ufrag = Some(arg.to_string()),
        ("ice-pwd", Some(arg)) => defaults.pwd = Some(arg.to_string()),
        ("fingerprint", Some(arg)) => defaults.fingerprint = Some(split_pair(arg)?),
        ("setup", Some(arg)) => defaults.setup = Some(arg.to_string()),
        _ => {}
    }
    Some(())
}

fn parse_media_attribute(
    section: &mut MediaSection,
    name: &str,
    arg: Option<&str>,
    author: Role,
) -> Option<()> {
    match (name, arg) {
        ("mid", Some(arg)) => section.name = Some(arg.to_string()),
        ("sendrecv" | "sendonly" | "recvonly" | "inactive", None) => {
            section.senders = Senders::from_direction(name, author)?;
        }
        ("rtcp-mux", None) => section.description.rtcp_mux = true,
        ("ice-ufrag", Some(arg)) => section.transport.ufrag = Some(arg.to_string()),
        ("ice-pwd", Some(arg)) => section.transport.pwd = Some(arg.to_string()),
        ("fingerprint", Some(arg)) => section.transport.fingerprint = Some(split_pair(arg)?),
        ("setup", Some(arg)) => section.transport.setup = Some(arg.to_string()),
        ("candidate", Some(arg)) => {
            let candidate: Candidate = format!("candidate:{}", arg).parse().ok()?;
            section.candidates.push(candidate);
        }
        ("rtpmap", Some(arg)) => {
            let (id, codec) = split_pair(arg)?;
            let mut codec_parts = codec.split('/');
            let codec_name = codec_parts.next()?.to_string();
            let clockrate: u32 = codec_parts.next()?.parse().ok()?;
            let channels: u8 = match codec_parts.next() {
                Some(c) => c.parse().ok()?,
                None => 1,
            };
            if let Some(payload) = section.payload_mut(id.parse().ok()?) {
                payload.name = Some(codec_name);
                payload.clockrate = Some(clockrate);
                payload.channels = channels;
            }
        }
        ("fmtp", Some(arg)) => {
            let (id, params) = split_pair(arg)?;
            if let Some(payload) = section.payload_mut(id.parse().ok()?) {
                payload.parameters = params
                    .split(';')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| match p.split_once('=') {
                        Some((n, v)) => Parameter::new(n.trim(), v.trim()),
                        None => Parameter::new("", p),
                    })
                    .collect();
            }
        }
        ("rtcp-fb", Some(arg)) => {
            let mut parts = arg.split_whitespace();
            let id = parts.next()?;
            let kind = parts.next()?.to_string();
            let subtype = parts.next().map(str::to_string);
            // Wildcard feedback is not representable per payload.
            if id != "*"
                && let Some(payload) = section.payload_mut(id.parse().ok()?)
            {
                payload.feedback.push(RtcpFeedback { kind, subtype });
            }
        }
        ("extmap", Some(arg)) => {
            let (id, uri) = split_pair(arg)?;
            // `1/sendonly` carries a direction we don't model.
            let id = id.split('/').next()?.parse().ok()?;
            let uri = uri.split_whitespace().next()?.to_string();
            section
                .description
                .header_extensions
                .push(HeaderExtension { id, uri });
        }
        ("ssrc", Some(arg)) => {
            let (ssrc, param) = match arg.split_once(' ') {
                Some((s, p)) => (s.parse::<u32>().ok()?, Some(p.trim())),
                None => (arg.parse::<u32>().ok()?, None),
            };
            let sources = &mut section.description.sources;
            let index = match sources.iter().position(|s| s.ssrc == ssrc) {
                Some(index) => index,
                None => {
                    sources.push(Source {
                        ssrc,
                        parameters: Vec::new(),
                    });
                    sources.len() - 1
                }
            };
            if let Some(param) = param {
                let parameter = match param.split_once(':') {
                    Some((n, v)) => Parameter::new(n, v),
                    None => Parameter::new(param, ""),
                };
                sources[index].parameters.push(parameter);
            }
        }
        ("ssrc-group", Some(arg)) => {
            let mut parts = arg.split_whitespace();
            let semantics = parts.next()?.to_string();
            let sources = parts
                .map(|s| s.parse::<u32>().ok())
                .collect::<Option<Vec<_>>>()?;
            section
                .description
                .source_groups
                .push(SourceGroup { semantics, sources });
        }
        _ => {}
    }
    Some(())
}

fn split_pair(arg: &str) -> Option<(String, String)> {
    let (first, second) = arg.split_once(' ')?;
    Some((first.to_string(), second.trim().to_string()))
}
