use evloop::Timestamp;

#[test]
fn invalid_is_the_zero_sentinel() {
    let invalid = Timestamp::invalid();
    assert!(!invalid.is_valid());
    assert_eq!(invalid.micros(), 0);
    assert_eq!(invalid, Timestamp::from_micros(0));
}

#[test]
fn now_is_valid_and_monotonic_enough() {
    let first = Timestamp::now();
    let second = Timestamp::now();
    assert!(first.is_valid());
    assert!(second >= first);
    assert!(first > Timestamp::invalid());
}

#[test]
fn second_arithmetic_keeps_microsecond_precision() {
    let base = Timestamp::from_micros(1_000_000);
    let later = base.add_seconds(1.5);
    assert_eq!(later.micros(), 2_500_000);
    assert!((later.seconds_since(base) - 1.5).abs() < 1e-9);

    let earlier = base.add_seconds(-0.25);
    assert_eq!(earlier.micros(), 750_000);
    assert!(earlier < base);
}

#[test]
fn display_renders_seconds_dot_micros() {
    let stamp = Timestamp::from_micros(1_234_567);
    assert_eq!(stamp.to_string(), "1.234567");

    let round = Timestamp::from_micros(5_000_000);
    assert_eq!(round.to_string(), "5.000000");
}

#[test]
fn formatted_string_renders_utc_wall_clock() {
    // 2009-02-13 23:31:30.123456 UTC
    let stamp = Timestamp::from_micros(1_234_567_890_123_456);
    assert_eq!(stamp.to_formatted_string(true), "20090213 23:31:30.123456");
    assert_eq!(stamp.to_formatted_string(false), "20090213 23:31:30");

    // midnight exactly, microseconds all zero
    let midnight = Timestamp::from_micros(1_609_459_200_000_000);
    assert_eq!(midnight.to_formatted_string(true), "20210101 00:00:00.000000");
}
