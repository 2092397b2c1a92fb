use log::trace;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct FlowPoolConfig {
    /// 预分配的槽位数
    pub initial_slots: usize,
    /// 空闲链表保留的最大槽位数, 超出的槽位不再复用
    pub max_free: usize,
}

impl Default for FlowPoolConfig {
    fn default() -> Self {
        Self {
            initial_slots: 1024,
            max_free: 65536,
        }
    }
}

/// 带代数校验的句柄, 槽位复用后旧句柄失效
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowHandle {
    index: u32,
    generation: u32,
}

impl FlowHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// 流记录内存池
///
/// Released slots go on a free list and are handed out again with a bumped
/// generation, so a handle kept past `release` never reaches the new owner.
#[derive(Debug)]
pub struct FlowPool<T> {
    config: FlowPoolConfig,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> FlowPool<T> {
    pub fn new(config: FlowPoolConfig) -> Self {
        Self {
            slots: Vec::with_capacity(config.initial_slots),
            free: Vec::new(),
            live: 0,
            config,
        }
    }

    pub fn acquire(&mut self, value: T) -> FlowHandle {
        self.live += 1;
        // 优先复用空闲槽位
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return FlowHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        FlowHandle { index, generation: 0 }
    }

    pub fn release(&mut self, handle: FlowHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        if self.free.len() < self.config.max_free {
            self.free.push(handle.index);
        } else {
            trace!("free list full, slot {} retired", handle.index);
        }
        Some(value)
    }

    pub fn get(&self, handle: FlowHandle) -> Option<&T> {
        let slot = self.slots.get(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: FlowHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, handle: FlowHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (FlowHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    FlowHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn available_slots(&self) -> usize {
        self.free.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
    }
}

impl<T> Default for FlowPool<T> {
    fn default() -> Self {
        Self::new(FlowPoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuse() {
        let mut pool = FlowPool::default();
        let h1 = pool.acquire("one");
        let h2 = pool.acquire("two");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(h1), Some(&"one"));

        assert_eq!(pool.release(h1), Some("one"));
        assert_eq!(pool.release(h1), None);
        assert_eq!(pool.get(h1), None);
        assert_eq!(pool.available_slots(), 1);

        let h3 = pool.acquire("three");
        assert_eq!(h3.index(), h1.index());
        assert_ne!(h3.generation(), h1.generation());
        // 旧句柄不能访问新值
        assert_eq!(pool.get(h1), None);
        assert_eq!(pool.get(h3), Some(&"three"));
        assert_eq!(pool.get(h2), Some(&"two"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut pool = FlowPool::default();
        let handles: Vec<_> = (0..5).map(|i| pool.acquire(i)).collect();
        pool.release(handles[1]);
        pool.release(handles[3]);
        let values: Vec<i32> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 2, 4]);
        for (h, v) in pool.iter() {
            assert_eq!(pool.get(h), Some(v));
        }
    }

    #[test]
    fn test_free_list_cap() {
        let mut pool = FlowPool::new(FlowPoolConfig {
            initial_slots: 0,
            max_free: 1,
        });
        let a = pool.acquire(1);
        let b = pool.acquire(2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available_slots(), 1);
        let c = pool.acquire(3);
        if let Some(v) = pool.get_mut(c) {
            *v += 1;
        }
        assert_eq!(pool.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![4]);
    }
}
