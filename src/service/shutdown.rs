// Copyright 2025 courier developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tokio::sync::broadcast;

/// Cooperative stop signal for a loop running on its own task.
///
/// Wraps a broadcast receiver so the owning loop can `select!` on `recv`
/// next to its blocking await point, and remembers having fired so later
/// polls return immediately.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    /// Creates a fresh signal pair: fire the sender, the receiver observes it.
    pub fn pair() -> (broadcast::Sender<()>, Shutdown) {
        let (tx, rx) = broadcast::channel(1);
        (tx, Shutdown::new(rx))
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_after_fire_returns_immediately() {
        let (tx, mut shutdown) = Shutdown::pair();
        assert!(!shutdown.is_shutdown());
        tx.send(()).unwrap();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        // second recv must not block
        shutdown.recv().await;
    }
}
