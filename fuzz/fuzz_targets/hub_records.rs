#![no_main]

use libfuzzer_sys::fuzz_target;
use todo_progress_core::hub_protocol::{self, HubMessage};
use todo_progress_core::JobStatus;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = std::str::from_utf8(data) else {
        return;
    };

    let _ = hub_protocol::parse_handshake_response(frame);

    for message in hub_protocol::decode_records(frame).into_iter().flatten() {
        // Whatever decodes must survive a re-encode.
        let encoded = hub_protocol::encode(&message);
        assert_eq!(hub_protocol::decode_records(&encoded).len(), 1);

        if let HubMessage::Invocation { arguments, .. } = message {
            for argument in arguments {
                let _ = serde_json::from_value::<JobStatus>(argument);
            }
        }
    }
});
