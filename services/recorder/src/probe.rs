//! Metadata trigger probe.
//!
//! Runs synchronously on the inference task for every frame: counts
//! detections per class, attaches the count overlay and, when a trigger class
//! is present and its latch is clear, queues a recording start request.
//! Nothing here blocks; start requests are enqueue-and-return.

use crate::config::{RearmPolicy, TriggerConfig};
use crate::frame::{ClassCounts, Frame, ObjectClass, OverlayAnnotation};
use crate::recording::{RequestId, SessionError, StartRequest, StartRequester};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Gate preventing repeated start requests while a condition persists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerLatch {
    request: Option<RequestId>,
}

impl TriggerLatch {
    pub fn is_set(&self) -> bool {
        self.request.is_some()
    }

    /// The start request issued when the latch was set.
    pub fn request(&self) -> Option<RequestId> {
        self.request
    }

    fn set(&mut self, request: RequestId) {
        self.request = Some(request);
    }

    fn clear(&mut self) {
        self.request = None;
    }
}

/// Statistics for the trigger probe.
#[derive(Debug, Default, Clone)]
pub struct ProbeStats {
    pub frames_seen: u64,
    /// Frames with missing or partly invalid detection metadata
    pub malformed_frames: u64,
    pub triggers_fired: u64,
    /// Start requests dropped because the controller queue was full
    pub requests_rejected: u64,
    pub latches_rearmed: u64,
}

/// What the probe did with one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub counts: ClassCounts,
    pub malformed: bool,
    pub triggered: Option<RequestId>,
}

/// Per-frame detection scanner and recording trigger.
pub struct TriggerProbe {
    classes: Vec<ObjectClass>,
    min_confidence: f32,
    pre_roll: Duration,
    duration: Duration,
    rearm: RearmPolicy,
    latches: HashMap<ObjectClass, TriggerLatch>,
    requester: Arc<dyn StartRequester>,
    stats: ProbeStats,
}

impl TriggerProbe {
    pub fn new(config: &TriggerConfig, requester: Arc<dyn StartRequester>) -> Self {
        let latches = config
            .classes
            .iter()
            .map(|class| (*class, TriggerLatch::default()))
            .collect();

        Self {
            classes: config.classes.clone(),
            min_confidence: config.min_confidence,
            pre_roll: config.pre_roll(),
            duration: config.duration(),
            rearm: config.rearm,
            latches,
            requester,
            stats: ProbeStats::default(),
        }
    }

    /// Get probe statistics.
    pub fn stats(&self) -> ProbeStats {
        self.stats.clone()
    }

    /// Latch state for a trigger class.
    pub fn latch(&self, class: ObjectClass) -> Option<TriggerLatch> {
        self.latches.get(&class).copied()
    }

    /// Scan one frame. Never fails; malformed metadata only suppresses the overlay.
    pub fn process(&mut self, frame: &mut Frame) -> ProbeReport {
        self.stats.frames_seen += 1;
        self.rearm_settled();

        let mut report = ProbeReport::default();
        let mut present: Vec<ObjectClass> = Vec::new();

        match frame.detections.as_deref() {
            None => report.malformed = true,
            Some(detections) => {
                for detection in detections {
                    let Some(class) = detection.validated_class() else {
                        report.malformed = true;
                        continue;
                    };
                    report.counts.increment(class);
                    if detection.confidence >= self.min_confidence && !present.contains(&class) {
                        present.push(class);
                    }
                }
            }
        }

        if report.malformed {
            self.stats.malformed_frames += 1;
            trace!(sequence = frame.sequence, "Malformed detection metadata, skipping overlay");
            frame.overlay = None;
        } else {
            frame.overlay = Some(OverlayAnnotation::for_counts(&report.counts));
        }

        debug!(
            frame_number = frame.sequence,
            num_objects = report.counts.reported(),
            vehicle_count = report.counts.get(ObjectClass::Vehicle),
            person_count = report.counts.get(ObjectClass::Person),
            "Frame scanned"
        );

        for class in present {
            if !self.classes.contains(&class) {
                continue;
            }
            if let Some(request) = self.fire(class, frame.pts) {
                report.triggered = Some(request);
                break;
            }
        }

        report
    }

    /// Clear latches whose session has ended, when the policy allows it.
    fn rearm_settled(&mut self) {
        if self.rearm != RearmPolicy::AfterSession {
            return;
        }

        for (class, latch) in self.latches.iter_mut() {
            if let Some(request) = latch.request() {
                if self.requester.is_settled(request) {
                    latch.clear();
                    self.stats.latches_rearmed += 1;
                    debug!(class = %class, "Trigger latch re-armed");
                }
            }
        }
    }

    fn fire(&mut self, class: ObjectClass, pts: Duration) -> Option<RequestId> {
        let latch = self.latches.get(&class).copied().unwrap_or_default();
        if latch.is_set() || !self.requester.is_idle() {
            return None;
        }

        let request = StartRequest::new(self.pre_roll, self.duration).with_trigger_pts(pts);
        match self.requester.request_start(request) {
            Ok(id) => {
                self.latches.entry(class).or_default().set(id);
                self.stats.triggers_fired += 1;
                info!(
                    class = %class,
                    pts_ms = pts.as_millis() as u64,
                    "Trigger fired, recording requested"
                );
                Some(id)
            }
            Err(SessionError::QueueFull) => {
                self.stats.requests_rejected += 1;
                warn!(class = %class, "Controller queue full, start request dropped");
                None
            }
            Err(e) => {
                warn!(class = %class, error = %e, "Start request failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, Detection};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Records start requests and lets the test decide when they settle.
    #[derive(Default)]
    struct MockRequester {
        requests: Mutex<Vec<StartRequest>>,
        settled: Mutex<HashSet<RequestId>>,
        busy: Mutex<bool>,
        full: Mutex<bool>,
    }

    impl MockRequester {
        fn settle_all(&self) {
            let count = self.requests.lock().len() as u64;
            let mut settled = self.settled.lock();
            for id in 0..count {
                settled.insert(RequestId(id));
            }
        }

        fn count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    impl StartRequester for MockRequester {
        fn request_start(&self, request: StartRequest) -> Result<RequestId, SessionError> {
            if *self.full.lock() {
                return Err(SessionError::QueueFull);
            }
            let mut requests = self.requests.lock();
            requests.push(request);
            Ok(RequestId(requests.len() as u64 - 1))
        }

        fn is_settled(&self, id: RequestId) -> bool {
            self.settled.lock().contains(&id)
        }

        fn is_idle(&self) -> bool {
            !*self.busy.lock()
        }
    }

    fn create_test_config(rearm: RearmPolicy) -> TriggerConfig {
        TriggerConfig {
            rearm,
            ..TriggerConfig::default()
        }
    }

    fn detection(class: ObjectClass) -> Detection {
        Detection::new(class, BoundingBox::new(10.0, 10.0, 20.0, 40.0), 0.9)
    }

    fn frame_with(sequence: u64, detections: Option<Vec<Detection>>) -> Frame {
        let mut frame = Frame::new(
            0,
            sequence,
            Duration::from_millis(sequence * 33),
            64,
            36,
            Bytes::new(),
        );
        frame.detections = detections;
        frame
    }

    #[test]
    fn test_counts_are_per_frame() {
        let requester = Arc::new(MockRequester::default());
        let mut probe = TriggerProbe::new(&create_test_config(RearmPolicy::Never), requester);

        let mut first = frame_with(
            0,
            Some(vec![
                detection(ObjectClass::Vehicle),
                detection(ObjectClass::Vehicle),
                detection(ObjectClass::RoadSign),
            ]),
        );
        let report = probe.process(&mut first);
        assert_eq!(report.counts.get(ObjectClass::Vehicle), 2);
        assert_eq!(first.overlay.unwrap().text, "Person = 0 Vehicle = 2 ");

        let mut second = frame_with(1, Some(vec![detection(ObjectClass::Vehicle)]));
        let report = probe.process(&mut second);
        assert_eq!(report.counts.get(ObjectClass::Vehicle), 1);
        assert_eq!(report.counts.get(ObjectClass::RoadSign), 0);
    }

    #[test]
    fn test_sustained_person_fires_once() {
        let requester = Arc::new(MockRequester::default());
        let mut probe = TriggerProbe::new(&create_test_config(RearmPolicy::Never), requester.clone());

        for i in 0..90 {
            let mut frame = frame_with(i, Some(vec![detection(ObjectClass::Person)]));
            probe.process(&mut frame);
        }

        assert_eq!(requester.count(), 1);
        assert_eq!(probe.stats().triggers_fired, 1);
        let request = requester.requests.lock()[0].clone();
        assert_eq!(request.pre_roll, Duration::from_secs(2));
        assert_eq!(request.duration, Duration::from_secs(7));
        assert_eq!(request.trigger_pts, Some(Duration::ZERO));
    }

    #[test]
    fn test_never_policy_stays_latched() {
        let requester = Arc::new(MockRequester::default());
        let mut probe = TriggerProbe::new(&create_test_config(RearmPolicy::Never), requester.clone());

        probe.process(&mut frame_with(0, Some(vec![detection(ObjectClass::Person)])));
        requester.settle_all();
        probe.process(&mut frame_with(1, Some(vec![detection(ObjectClass::Person)])));

        assert_eq!(requester.count(), 1);
        assert!(probe.latch(ObjectClass::Person).unwrap().is_set());
    }

    #[test]
    fn test_after_session_policy_rearms() {
        let requester = Arc::new(MockRequester::default());
        let mut probe = TriggerProbe::new(
            &create_test_config(RearmPolicy::AfterSession),
            requester.clone(),
        );

        probe.process(&mut frame_with(0, Some(vec![detection(ObjectClass::Person)])));
        probe.process(&mut frame_with(1, Some(vec![detection(ObjectClass::Person)])));
        assert_eq!(requester.count(), 1);

        requester.settle_all();
        let report = probe.process(&mut frame_with(2, Some(vec![detection(ObjectClass::Person)])));
        assert_eq!(report.triggered, Some(RequestId(1)));
        assert_eq!(requester.count(), 2);
        assert_eq!(probe.stats().latches_rearmed, 1);
    }

    #[test]
    fn test_no_request_while_controller_busy() {
        let requester = Arc::new(MockRequester::default());
        *requester.busy.lock() = true;
        let mut probe = TriggerProbe::new(
            &create_test_config(RearmPolicy::AfterSession),
            requester.clone(),
        );

        probe.process(&mut frame_with(0, Some(vec![detection(ObjectClass::Person)])));
        assert_eq!(requester.count(), 0);
        assert!(!probe.latch(ObjectClass::Person).unwrap().is_set());

        *requester.busy.lock() = false;
        probe.process(&mut frame_with(1, Some(vec![detection(ObjectClass::Person)])));
        assert_eq!(requester.count(), 1);
    }

    #[test]
    fn test_non_trigger_class_does_not_fire() {
        let requester = Arc::new(MockRequester::default());
        let mut probe = TriggerProbe::new(&create_test_config(RearmPolicy::Never), requester.clone());

        probe.process(&mut frame_with(0, Some(vec![detection(ObjectClass::Vehicle)])));
        assert_eq!(requester.count(), 0);
    }

    #[test]
    fn test_low_confidence_counts_without_firing() {
        let requester = Arc::new(MockRequester::default());
        let mut probe = TriggerProbe::new(&create_test_config(RearmPolicy::Never), requester.clone());

        let mut weak = detection(ObjectClass::Person);
        weak.confidence = 0.2;
        let report = probe.process(&mut frame_with(0, Some(vec![weak])));
        assert_eq!(report.counts.get(ObjectClass::Person), 1);
        assert_eq!(requester.count(), 0);
    }

    #[test]
    fn test_malformed_metadata_tolerated() {
        let requester = Arc::new(MockRequester::default());
        let mut probe = TriggerProbe::new(&create_test_config(RearmPolicy::Never), requester.clone());

        let mut missing = frame_with(0, None);
        let report = probe.process(&mut missing);
        assert!(report.malformed);
        assert!(missing.overlay.is_none());

        let mut bad = detection(ObjectClass::Vehicle);
        bad.bbox.width = f32::NAN;
        let mut partial = frame_with(1, Some(vec![bad, detection(ObjectClass::Person)]));
        let report = probe.process(&mut partial);
        assert!(report.malformed);
        assert!(partial.overlay.is_none());
        // Valid detections still count and still trigger
        assert_eq!(report.counts.get(ObjectClass::Person), 1);
        assert_eq!(report.counts.get(ObjectClass::Vehicle), 0);
        assert!(report.triggered.is_some());
        assert_eq!(probe.stats().malformed_frames, 2);
    }

    #[test]
    fn test_full_queue_leaves_latch_clear() {
        let requester = Arc::new(MockRequester::default());
        *requester.full.lock() = true;
        let mut probe = TriggerProbe::new(&create_test_config(RearmPolicy::Never), requester.clone());

        probe.process(&mut frame_with(0, Some(vec![detection(ObjectClass::Person)])));
        assert_eq!(probe.stats().requests_rejected, 1);
        assert!(!probe.latch(ObjectClass::Person).unwrap().is_set());
    }
}
