//! Worker routing: per-device ordering across interleaved devices.

mod common;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use voxedge::event::{Event, SessionSnapshot, TopicHandler, WorkerPool};

struct Recorder {
    by_device: Mutex<HashMap<String, Vec<String>>>,
    done: tokio::sync::mpsc::UnboundedSender<()>,
}

impl TopicHandler for Recorder {
    fn routing_key(&self, event: &Event) -> Option<String> {
        match event {
            Event::SessionEnd { state } => Some(state.device_id.clone()),
            _ => None,
        }
    }

    fn handle(&self, event: Event) {
        if let Event::SessionEnd { state } = event {
            self.by_device
                .lock()
                .entry(state.device_id)
                .or_default()
                .push(state.session_id);
            let _ = self.done.send(());
        }
    }
}

fn event(device: &str, seq: usize) -> Event {
    Event::SessionEnd {
        state: SessionSnapshot {
            device_id: device.to_string(),
            session_id: format!("{device}-{seq}"),
        },
    }
}

#[tokio::test]
async fn events_for_one_device_arrive_in_publish_order() {
    let pool = WorkerPool::new(4);
    let (done, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let recorder = Arc::new(Recorder {
        by_device: Mutex::new(HashMap::new()),
        done,
    });
    pool.register("session.end", recorder.clone());

    let devices = ["ba:8f:17:de:94:94", "aa:00:00:00:00:01", "cc:12:34:56:78:9a"];
    let per_device = 40;
    let mut total = 0;
    for seq in 0..per_device {
        for device in devices {
            assert!(pool.route("session.end", event(device, seq)));
            total += 1;
        }
    }
    for _ in 0..total {
        done_rx.recv().await.unwrap();
    }

    let by_device = recorder.by_device.lock();
    for device in devices {
        let expected: Vec<String> = (0..per_device).map(|i| format!("{device}-{i}")).collect();
        assert_eq!(by_device[device], expected, "order broken for {device}");
    }
    pool.close().await;
}

#[tokio::test]
async fn single_worker_still_preserves_order() {
    let pool = WorkerPool::new(1);
    let (done, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let recorder = Arc::new(Recorder {
        by_device: Mutex::new(HashMap::new()),
        done,
    });
    pool.register("session.end", recorder.clone());

    for seq in 0..30 {
        assert!(pool.route("session.end", event("d1", seq)));
    }
    for _ in 0..30 {
        done_rx.recv().await.unwrap();
    }

    let by_device = recorder.by_device.lock();
    let expected: Vec<String> = (0..30).map(|i| format!("d1-{i}")).collect();
    assert_eq!(by_device["d1"], expected);
    pool.close().await;
}
