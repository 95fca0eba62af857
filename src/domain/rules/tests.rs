// Unit tests for business rules

use super::*;
use crate::domain::settings::DEFAULT_AUDIO_BIT_RATE;

#[test]
fn test_presets_strictly_increase() {
    for pair in Preset::ALL.windows(2) {
        let (lower, higher) = (pair[0], pair[1]);
        let a = PresetTable::resolution_for(lower);
        let b = PresetTable::resolution_for(higher);
        assert!(b.width > a.width, "{} -> {}", lower, higher);
        assert!(b.height > a.height, "{} -> {}", lower, higher);
        assert!(PresetTable::bitrate_for(higher) > PresetTable::bitrate_for(lower));
    }
}

#[test]
fn test_preset_table_values() {
    assert_eq!(PresetTable::resolution_for(Preset::P480), Size::new(480, 640));
    assert_eq!(PresetTable::resolution_for(Preset::P4K), Size::new(2160, 3840));
    assert_eq!(PresetTable::bitrate_for(Preset::P540), 2_074_000);
    assert_eq!(PresetTable::bitrate_for(Preset::P1080), 7_900_000);
}

#[test]
fn test_preset_for_exact_boxes() {
    for preset in Preset::ALL {
        let size = PresetTable::resolution_for(preset);
        assert_eq!(PresetTable::preset_for(size), preset);
        assert_eq!(PresetTable::preset_for(size.swapped()), preset);
    }
}

#[test]
fn test_preset_for_picks_smallest_enclosing_box() {
    assert_eq!(PresetTable::preset_for(Size::new(1280, 720)), Preset::P720);
    assert_eq!(PresetTable::preset_for(Size::new(1000, 600)), Preset::P720);
    assert_eq!(PresetTable::preset_for(Size::new(100, 100)), Preset::P240);
    assert_eq!(PresetTable::preset_for(Size::new(1920, 1081)), Preset::P2K);
}

#[test]
fn test_preset_for_falls_back_to_smallest() {
    assert_eq!(PresetTable::preset_for(Size::new(8000, 5000)), Preset::P240);
}

#[test]
fn test_preset_parsing() {
    assert_eq!("720p".parse::<Preset>().unwrap(), Preset::P720);
    assert_eq!("1080P".parse::<Preset>().unwrap(), Preset::P1080);
    assert_eq!("4K".parse::<Preset>().unwrap(), Preset::P4K);
    assert_eq!("480".parse::<Preset>().unwrap(), Preset::P480);
    assert!("900p".parse::<Preset>().is_err());
    assert_eq!(Preset::P2K.to_string(), "2k");
}

#[test]
fn test_derive_keeps_size_that_already_fits() {
    let settings = VideoSettingsDeriver::derive_video_settings(Size::new(720, 1280), Preset::P720);
    assert_eq!((settings.width, settings.height), (720, 1280));
    assert_eq!(settings.compression.average_bit_rate, 3_500_000);
}

#[test]
fn test_derive_scales_landscape_down() {
    let settings = VideoSettingsDeriver::derive_video_settings(Size::new(1920, 1080), Preset::P720);
    assert_eq!((settings.width, settings.height), (1280, 720));
    assert_eq!(settings.compression.average_bit_rate, 3_500_000);
}

#[test]
fn test_derive_scales_portrait_and_rounds_even() {
    let settings = VideoSettingsDeriver::derive_video_settings(Size::new(720, 1280), Preset::P480);
    assert_eq!((settings.width, settings.height), (480, 854));
    assert_eq!(settings.compression.average_bit_rate, PresetTable::bitrate_for(Preset::P540));
}

#[test]
fn test_derive_never_upscales() {
    let settings = VideoSettingsDeriver::derive_video_settings(Size::new(640, 360), Preset::P1080);
    assert_eq!((settings.width, settings.height), (640, 360));
    assert_eq!(settings.compression.average_bit_rate, PresetTable::bitrate_for(Preset::P480));
}

#[test]
fn test_estimated_output_size() {
    let ten_seconds = TimeSpec::from_seconds(10.0);
    assert_eq!(
        SizeEstimator::estimated_output_size(Some(DEFAULT_AUDIO_BIT_RATE), Some(3_500_000), ten_seconds),
        (128_000 + 3_500_000) / 8 * 10
    );
    assert_eq!(SizeEstimator::estimated_output_size(None, Some(3_500_000), ten_seconds), 0);
    assert_eq!(SizeEstimator::estimated_output_size(Some(128_000), Some(0), ten_seconds), 0);
}
