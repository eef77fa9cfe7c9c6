//! Event trees through run files and custom event types.

use daq_runcontrol::codec::file::{FileReader, FileVersion, FileWriter};
use daq_runcontrol::codec::{BufferSerializer, Decode, Deserializer};
use daq_runcontrol::error::{AppResult, DaqError};
use daq_runcontrol::event::{event_registry, type_id, Event, EventFlags};

fn telescope_event(n: u32) -> Event {
    let mut ev = Event::new("TelescopeEvent", 42, 0).with_description("telescope");
    ev.set_event_n(n);
    ev.set_trigger_n(n * 2);
    ev.set_timestamps(u64::from(n) * 25, u64::from(n) * 25 + 24);
    ev.set_tag("plane_count", "2");
    for plane in 0..2 {
        let mut sub = Event::new("RawEvent", 42, plane + 1);
        sub.set_event_n(n);
        sub.add_block(0, vec![plane as u8; 16]);
        ev.add_sub_event(sub);
    }
    ev
}

#[test]
fn test_custom_type_roundtrips_through_both_file_versions() {
    let tag = event_registry().register_standard("TelescopeEvent").unwrap();
    assert_eq!(tag, type_id("TelescopeEvent"));

    for version in [FileVersion::V1, FileVersion::V2] {
        let file = tempfile::NamedTempFile::new().unwrap();
        {
            let mut writer = FileWriter::create(file.path(), version).unwrap();
            writer.write_event(&Event::bore("TelescopeEvent", 42, 0)).unwrap();
            for n in 1..=20 {
                writer.write_event(&telescope_event(n)).unwrap();
            }
            writer.write_event(&Event::eore("TelescopeEvent", 42, 0, 21)).unwrap();
        }

        let reader = FileReader::open(file.path(), version).unwrap();
        let events: Vec<Event> = reader.collect::<AppResult<_>>().unwrap();
        assert_eq!(events.len(), 22);
        assert!(events[0].is_bore());
        assert!(events[21].is_eore());
        assert_eq!(events[5], telescope_event(5));
        assert!(events[5].flags().contains(EventFlags::TIMESTAMP));
        assert_eq!(events[5].sub_events()[1].block(0), Some(&[1u8; 16][..]));
    }
}

#[test]
fn test_skipping_matches_reading_sequentially() {
    event_registry().register_standard("TelescopeEvent").unwrap();
    for version in [FileVersion::V1, FileVersion::V2] {
        let file = tempfile::NamedTempFile::new().unwrap();
        {
            let mut writer = FileWriter::create(file.path(), version).unwrap();
            for n in 0..30 {
                writer.write_event(&telescope_event(n)).unwrap();
            }
        }

        let mut sequential = FileReader::open(file.path(), version).unwrap();
        let mut skipping = FileReader::open(file.path(), version).unwrap();
        let mut expected = Vec::new();
        for _ in 0..30 {
            expected.push(sequential.read_event(0).unwrap().unwrap());
        }

        let mut index = 0;
        for skip in [0usize, 3, 7, 1] {
            index += skip;
            let got = skipping.read_event(skip).unwrap().unwrap();
            assert_eq!(got, expected[index], "{version:?} skip {skip}");
            index += 1;
        }
        assert!(skipping.read_event(100).unwrap().is_none());
    }
}

fn decode_rejecting(de: &mut dyn Deserializer) -> AppResult<Event> {
    let _tag = u32::decode(de)?;
    Err(DaqError::FileRead("checksum mismatch".into()))
}

#[test]
fn test_custom_decoder_errors_surface_to_the_reader() {
    event_registry().register("CorruptEvent", decode_rejecting).unwrap();
    let buf = BufferSerializer::encode_value(&Event::new("CorruptEvent", 1, 0)).unwrap();
    let result = BufferSerializer::decode_value::<Event>(buf.remaining());
    assert!(matches!(result, Err(DaqError::FileRead(_))));
}
