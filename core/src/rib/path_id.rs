// Copyright 2025 ribd Authors
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

use std::collections::BTreeSet;

/// ADD-PATH local path IDs of one destination (RFC 7911).
///
/// IDs are 1-based; 0 marks a path that has not been assigned one. The
/// lowest free ID is handed out first so IDs stay dense after churn.
#[derive(Debug, Default, Clone)]
pub struct PathIdPool {
    used: BTreeSet<u32>,
}

impl PathIdPool {
    pub fn alloc(&mut self) -> u32 {
        let mut id = 1;
        for used in &self.used {
            if *used != id {
                break;
            }
            id += 1;
        }
        self.used.insert(id);
        id
    }

    /// No-op for 0 and for IDs never handed out.
    pub fn release(&mut self, id: u32) {
        self.used.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_id_pool() {
        // "a" allocates, "rN" releases N
        let tests = [
            ("sequential alloc", vec!["a", "a", "a"], vec![1, 2, 3]),
            ("release and reuse", vec!["a", "a", "a", "r2", "a"], vec![1, 2, 3, 2]),
            ("release lowest", vec!["a", "a", "r1", "a", "a"], vec![1, 2, 1, 3]),
            ("release 0 is no-op", vec!["r0", "a"], vec![1]),
        ];

        for (name, ops, expected) in tests {
            let mut pool = PathIdPool::default();
            let mut allocated = Vec::new();
            for op in ops {
                match op.strip_prefix('r') {
                    Some(id) => pool.release(id.parse().unwrap()),
                    None => allocated.push(pool.alloc()),
                }
            }
            assert_eq!(allocated, expected, "test case: {}", name);
        }
    }

    #[test]
    fn test_len_tracks_releases() {
        let mut pool = PathIdPool::default();
        for _ in 0..70 {
            pool.alloc();
        }
        assert_eq!(pool.used.len(), 70);
        pool.release(70);
        pool.release(70);
        assert_eq!(pool.used.len(), 69);
        assert_eq!(pool.alloc(), 70);
    }
}
