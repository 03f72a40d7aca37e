//! Voice component integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;

use parlance::voice::{
    SAMPLE_RATE, VadEvent, VadState, VoiceActivitySegmenter, decode_clip, frame_bytes,
    pcm_to_wav, resample_audio,
};

mod common;

use common::{active_frame, silent_frame};

const FRAME_SAMPLES: usize = 320;

#[test]
fn test_twenty_active_then_forty_silent() {
    let mut vad = VoiceActivitySegmenter::new(0.4, 2);
    let mut events = Vec::new();

    for i in 0..20 {
        if let Some(event) = vad.process(&active_frame(FRAME_SAMPLES)) {
            events.push((i, event));
        }
    }
    for i in 20..60 {
        if let Some(event) = vad.process(&silent_frame(FRAME_SAMPLES)) {
            events.push((i, event));
        }
    }

    assert_eq!(events.len(), 2);
    assert_eq!(events[0], (0, VadEvent::SpeechStart));

    // Ends on the second silent frame
    let (index, VadEvent::SpeechEnd(utterance)) = &events[1] else {
        panic!("expected speech end, got {:?}", events[1]);
    };
    assert_eq!(*index, 21);
    assert_eq!(utterance.sequence, 0);
    assert_eq!(utterance.audio.len(), 20 * FRAME_SAMPLES * 2);
    assert_eq!(vad.state(), VadState::Silence);
}

#[test]
fn test_all_silence_never_starts_speech() {
    let mut vad = VoiceActivitySegmenter::from_durations(0.4, 1000, 250);
    for _ in 0..100 {
        assert!(vad.process(&silent_frame(4000)).is_none());
    }
    assert_eq!(vad.state(), VadState::Silence);
    assert!(vad.speech_buffer().is_empty());
}

#[test]
fn test_quiet_noise_stays_below_threshold() {
    let mut vad = VoiceActivitySegmenter::new(0.4, 2);
    // ~0.15 normalized energy
    let noise = common::pcm_frame(5_000, FRAME_SAMPLES);
    for _ in 0..50 {
        assert!(vad.process(&noise).is_none());
    }
}

#[test]
fn test_pause_shorter_than_threshold_keeps_one_utterance() {
    let mut vad = VoiceActivitySegmenter::new(0.4, 3);
    let frames = [
        active_frame(FRAME_SAMPLES),
        active_frame(FRAME_SAMPLES),
        silent_frame(FRAME_SAMPLES),
        silent_frame(FRAME_SAMPLES),
        active_frame(FRAME_SAMPLES),
        silent_frame(FRAME_SAMPLES),
        silent_frame(FRAME_SAMPLES),
        silent_frame(FRAME_SAMPLES),
    ];

    let events: Vec<VadEvent> = frames.iter().filter_map(|f| vad.process(f)).collect();

    assert_eq!(events.len(), 2);
    let VadEvent::SpeechEnd(utterance) = &events[1] else {
        panic!("expected speech end");
    };
    // Only the three active frames are kept
    assert_eq!(utterance.audio.len(), 3 * FRAME_SAMPLES * 2);
}

#[test]
fn test_sequences_increase_across_utterances() {
    let mut vad = VoiceActivitySegmenter::new(0.4, 1);
    let mut sequences = Vec::new();

    for _ in 0..3 {
        vad.process(&active_frame(FRAME_SAMPLES));
        if let Some(VadEvent::SpeechEnd(utterance)) = vad.process(&silent_frame(FRAME_SAMPLES)) {
            sequences.push(utterance.sequence);
        }
    }

    assert_eq!(sequences, vec![0, 1, 2]);
}

#[test]
fn test_frame_bytes() {
    assert_eq!(frame_bytes(250), 8000);
    assert_eq!(frame_bytes(20), 640);
}

#[test]
fn test_pcm_to_wav_header() {
    let pcm = active_frame(1600);
    let wav = pcm_to_wav(&pcm, SAMPLE_RATE).unwrap();

    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len(), 1600);
}

#[test]
fn test_decode_clip_from_wav() {
    let wav = pcm_to_wav(&active_frame(480), SAMPLE_RATE).unwrap();
    let (samples, rate) = decode_clip(&wav).unwrap();

    assert_eq!(rate, SAMPLE_RATE);
    assert_eq!(samples.len(), 480);
    assert!(samples.iter().all(|s| (*s - 20_000.0 / 32_768.0).abs() < 1e-3));
}

#[test]
fn test_decode_clip_rejects_garbage() {
    assert!(decode_clip(b"definitely not audio").is_err());
}

#[test]
fn test_resample_to_device_rate() {
    let samples = vec![0.25_f32; 16_000];
    let resampled = resample_audio(&samples, 16_000, 48_000).unwrap();
    assert_eq!(resampled.len(), 48_000);
}
