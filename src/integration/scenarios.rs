//! Producer-to-consumer scenarios under controlled delay, jitter, loss and
//! outage, all on paused tokio time

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::{ConsumerConfig, FecConfig, ProducerConfig};
    use crate::integration::fixtures::{rig, run_source, LinkConfig};
    use crate::name::SegmentClass;
    use crate::stats::Indicator;

    fn producer_config(gop_size: u32) -> ProducerConfig {
        ProducerConfig {
            stream_prefix: "/lab/cam".into(),
            thread_name: "hd".into(),
            segment_payload_size: 1000,
            freshness_ms: 2000,
            gop_size,
            fec: FecConfig { parity_ratio: 0.2 },
        }
    }

    fn consumer_config(fps: f64, target_ms: u64) -> ConsumerConfig {
        ConsumerConfig {
            buffer_capacity: 60,
            segment_payload_size: 1000,
            jitter_target_ms: target_ms,
            producer_rate_fps: fps,
            interest_lifetime_ms: 500,
            pipeline_depth: 10,
            rebuffer_threshold_ms: 3000,
            max_underruns: 10,
            fec: FecConfig { parity_ratio: 0.2 },
        }
    }

    /// Steady 30 fps stream over a 100 ms path: every frame is delivered,
    /// in order, at the source rate.
    #[tokio::test(start_paused = true)]
    async fn test_steady_stream_plays_all_frames_at_source_rate() {
        let mut r = rig(
            LinkConfig {
                delay_ms: 100,
                deviation_ms: 0,
                seed: 11,
            },
            producer_config(30),
            consumer_config(30.0, 100),
            2500,
        );
        r.consumer.start();
        // the join interest reaches the producer before the first frame
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut pipeline = r.pipeline;
        let producer = tokio::spawn(async move {
            run_source(&mut pipeline, 30.0, 100).await;
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        producer.await.unwrap();
        r.consumer.stop().await;

        let delivered = r.delivered.delivered.lock();
        assert_eq!(delivered.len(), 100, "every published frame plays");

        // strict playback order, no holes
        for (i, (info, _, _)) in delivered.iter().enumerate() {
            assert_eq!(info.playback_no, i as u64);
        }

        // source-rate pacing, measured past the start-up fast-forward (the
        // supervisor drains whatever buffered beyond the target before the
        // first paced tick)
        let steady = &delivered[10..];
        let span = steady.last().unwrap().1 - steady.first().unwrap().1;
        let rate = (steady.len() - 1) as f64 / span.as_secs_f64();
        assert!((rate - 30.0).abs() < 0.1, "playout rate {}", rate);

        assert!(r.recorder.skipped.lock().is_empty());
        assert_eq!(r.consumer.rebuffer_count(), 0);
        assert_eq!(r.producer_stats.get(Indicator::PublishedNum), 100);
    }

    /// 22 fps under 100±50 ms one-way jitter for 10 s: the average playout
    /// period matches the average publish period within a millisecond.
    #[tokio::test(start_paused = true)]
    async fn test_playout_rate_matches_publish_rate_under_deviation() {
        let mut r = rig(
            LinkConfig {
                delay_ms: 100,
                deviation_ms: 50,
                seed: 23,
            },
            producer_config(22),
            consumer_config(22.0, 200),
            2500,
        );
        r.consumer.start();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut pipeline = r.pipeline;
        let producer = tokio::spawn(async move {
            run_source(&mut pipeline, 22.0, 220).await;
        });

        tokio::time::sleep(Duration::from_secs(12)).await;
        producer.await.unwrap();
        r.consumer.stop().await;

        let delivered = r.delivered.delivered.lock();
        assert_eq!(delivered.len(), 220, "jitter alone drops nothing");

        // compare periods in steady state, past the start-up fast-forward
        let steady = &delivered[10..];
        let n = steady.len() as f64;
        let play_span = (steady.last().unwrap().1 - steady.first().unwrap().1).as_secs_f64();
        let publish_span_ms = (steady.last().unwrap().0.timestamp_us
            - steady.first().unwrap().0.timestamp_us) as f64
            / 1000.0;

        let avg_play_period_ms = play_span * 1000.0 / (n - 1.0);
        let avg_publish_period_ms = publish_span_ms / (n - 1.0);
        assert!(
            (avg_play_period_ms - avg_publish_period_ms).abs() < 1.0,
            "play period {} vs publish period {}",
            avg_play_period_ms,
            avg_publish_period_ms
        );

        let play_rate = (n - 1.0) / play_span;
        let publish_rate = (n - 1.0) * 1000.0 / publish_span_ms;
        assert!(
            (play_rate - publish_rate).abs() < 0.1,
            "play {} vs publish {}",
            play_rate,
            publish_rate
        );
    }

    /// One lost data segment of one delta frame is absorbed by parity: the
    /// frame is recovered, nothing is skipped.
    #[tokio::test(start_paused = true)]
    async fn test_single_segment_loss_recovered_by_parity() {
        let mut r = rig(
            LinkConfig {
                delay_ms: 50,
                deviation_ms: 0,
                seed: 31,
            },
            producer_config(22),
            consumer_config(22.0, 100),
            2500,
        );
        // segment 1 of delta 10 never reaches the consumer
        r.link.set_drop_filter(Some(Box::new(|name| {
            name.frame.class == crate::name::FrameClass::Delta
                && name.frame.packet_no == 10
                && name.class == SegmentClass::Data
                && name.segment == 1
        })));

        r.consumer.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut pipeline = r.pipeline;
        let producer = tokio::spawn(async move {
            run_source(&mut pipeline, 22.0, 66).await;
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        producer.await.unwrap();
        r.consumer.stop().await;

        let delivered = r.delivered.delivered.lock();
        assert_eq!(delivered.len(), 66);
        assert!(r.consumer.stats().get(Indicator::RecoveredNum) >= 1);
        assert!(r.recorder.skipped.lock().is_empty());
    }

    /// Losing all data segments of one delta (parity kept) skips deltas up
    /// to the next key frame; the stream then resumes cleanly.
    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_delta_skips_until_next_key() {
        let mut r = rig(
            LinkConfig {
                delay_ms: 50,
                deviation_ms: 0,
                seed: 37,
            },
            producer_config(22),
            consumer_config(22.0, 100),
            2500,
        );
        // every data segment of delta 10 is lost, its parity survives
        r.link.set_drop_filter(Some(Box::new(|name| {
            name.frame.class == crate::name::FrameClass::Delta
                && name.frame.packet_no == 10
                && name.class == SegmentClass::Data
        })));

        r.consumer.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut pipeline = r.pipeline;
        let producer = tokio::spawn(async move {
            run_source(&mut pipeline, 22.0, 66).await;
        });

        tokio::time::sleep(Duration::from_secs(8)).await;
        producer.await.unwrap();
        r.consumer.stop().await;

        // delta 10 is frame index 11, so playback numbers 0..=10 play,
        // 11..=21 are lost or skipped, and the key at 22 restores the GOP
        let delivered = r.delivered.delivered.lock();
        let played: Vec<u64> = delivered.iter().map(|(info, _, _)| info.playback_no).collect();
        assert!(played.contains(&10));
        assert!(!played.contains(&11), "the lost frame cannot play");
        assert!(played.contains(&22), "the next key restores playback");
        assert!(played.contains(&23), "deltas after the key play normally");

        let skipped = r.recorder.skipped.lock();
        assert!(
            skipped.iter().any(|(_, is_key)| !*is_key),
            "delta frames were skipped"
        );
        // the unrecoverable slot surfaces a recovery failure once drained
        assert!(r
            .recorder
            .recovery_failures
            .lock()
            .iter()
            .any(|(sample, is_key)| *sample == 10 && !*is_key));
        // no frames between the loss and the key slipped through
        for pb in 11..22 {
            assert!(!played.contains(&pb), "playback {} leaked", pb);
        }
    }

    /// A five-second outage forces exactly one rebuffer; playback resumes
    /// at the producer tip afterwards.
    #[tokio::test(start_paused = true)]
    async fn test_outage_rebuffers_once_and_resumes() {
        let mut r = rig(
            LinkConfig {
                delay_ms: 50,
                deviation_ms: 0,
                seed: 41,
            },
            producer_config(30),
            consumer_config(30.0, 100),
            2500,
        );
        r.consumer.start();

        let mut pipeline = r.pipeline;
        let producer = tokio::spawn(async move {
            run_source(&mut pipeline, 30.0, 210).await;
        });

        // one second of healthy streaming
        tokio::time::sleep(Duration::from_secs(1)).await;
        r.link.set_cut(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        r.link.set_cut(false);
        tokio::time::sleep(Duration::from_millis(2500)).await;

        producer.await.unwrap();
        r.consumer.stop().await;

        assert_eq!(r.consumer.rebuffer_count(), 1, "exactly one rebuffer");

        let delivered = r.delivered.delivered.lock();
        let played: Vec<u64> = delivered.iter().map(|(info, _, _)| info.playback_no).collect();
        assert!(played.contains(&0), "played before the outage");
        assert!(
            played.iter().any(|pb| *pb >= 180),
            "resumed at the producer tip, got up to {:?}",
            played.iter().max()
        );
        assert!(r.consumer.stats().get(Indicator::UnderrunNum) >= 1);
    }
}
