//! SDP input descriptors handed to the transcoder.

use std::fmt::Write as _;
use std::net::IpAddr;

use relaycast_ipc::{CodecDescriptor, MediaKind};

use crate::endpoint::RelayEndpoint;
use crate::ports::PortPair;

/// Build the SDP document describing one relayed RTP stream as seen by the
/// receiving transcoder.
pub fn input_descriptor(
    ip: IpAddr,
    ports: PortPair,
    kind: MediaKind,
    codec: &CodecDescriptor,
) -> String {
    let addr_type = match ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    };
    let pt = codec.payload_type;

    let mut sdp = String::with_capacity(256);
    // Writing into a String cannot fail.
    let _ = writeln!(sdp, "v=0");
    let _ = writeln!(sdp, "o=- 0 0 IN {addr_type} {ip}");
    let _ = writeln!(sdp, "s=relaycast");
    let _ = writeln!(sdp, "c=IN {addr_type} {ip}");
    let _ = writeln!(sdp, "t=0 0");
    let _ = writeln!(sdp, "m={} {} RTP/AVP {pt}", kind.as_str(), ports.media);
    let _ = writeln!(sdp, "a=rtcp:{}", ports.control);

    let mut rtpmap = format!("a=rtpmap:{pt} {}/{}", codec.encoding_name(), codec.clock_rate);
    if let Some(channels) = codec.channels.filter(|_| kind == MediaKind::Audio) {
        let _ = write!(rtpmap, "/{channels}");
    }
    let _ = writeln!(sdp, "{rtpmap}");

    if let Some(fmtp) = codec.fmtp() {
        let _ = writeln!(sdp, "a=fmtp:{pt} {fmtp}");
    }
    let _ = writeln!(sdp, "a=recvonly");

    sdp
}

/// Descriptor for an allocated endpoint.
pub fn endpoint_descriptor(endpoint: &RelayEndpoint, ip: IpAddr) -> String {
    let producer = endpoint.producer();
    input_descriptor(ip, endpoint.ports(), producer.kind, &producer.codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_video_descriptor_uses_negotiated_codec() {
        let mut parameters = BTreeMap::new();
        parameters.insert("packetization-mode".to_string(), "1".to_string());
        parameters.insert("profile-level-id".to_string(), "42e01f".to_string());
        let codec = CodecDescriptor {
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: None,
            payload_type: 102,
            parameters,
        };

        let sdp = input_descriptor(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            PortPair { media: 20000, control: 20001 },
            MediaKind::Video,
            &codec,
        );

        assert_eq!(
            sdp,
            "v=0\n\
             o=- 0 0 IN IP4 127.0.0.1\n\
             s=relaycast\n\
             c=IN IP4 127.0.0.1\n\
             t=0 0\n\
             m=video 20000 RTP/AVP 102\n\
             a=rtcp:20001\n\
             a=rtpmap:102 H264/90000\n\
             a=fmtp:102 packetization-mode=1;profile-level-id=42e01f\n\
             a=recvonly\n"
        );
    }

    #[test]
    fn test_audio_descriptor_includes_channels() {
        let codec = CodecDescriptor {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            payload_type: 111,
            parameters: BTreeMap::new(),
        };

        let sdp = input_descriptor(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            PortPair { media: 20002, control: 20003 },
            MediaKind::Audio,
            &codec,
        );

        assert!(sdp.contains("c=IN IP6 ::1\n"));
        assert!(sdp.contains("m=audio 20002 RTP/AVP 111\n"));
        assert!(sdp.contains("a=rtpmap:111 opus/48000/2\n"));
        assert!(!sdp.contains("a=fmtp"));
    }
}
