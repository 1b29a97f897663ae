use std::{collections::HashMap, hash::Hash};
use tracing::debug;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    size: u64,
    last_used: u64,
}

/// Cache LRU acotado por tamaño total en bytes
#[derive(Debug)]
pub struct ByteLru<K, V> {
    entries: HashMap<K, Slot<V>>,
    total_bytes: u64,
    capacity_bytes: u64,
    clock: u64,
}

impl<K, V> ByteLru<K, V>
where
    K: Clone + Eq + Hash,
{
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            total_bytes: 0,
            capacity_bytes,
            clock: 0,
        }
    }

    /// Obtiene una entrada marcándola como usada recientemente
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.tick();
        let slot = self.entries.get_mut(key)?;
        slot.last_used = tick;
        Some(&slot.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserta y devuelve lo que haya que descartar.
    ///
    /// Una entrada más grande que la capacidad total se devuelve tal cual
    /// sin insertarse. La entrada recién insertada nunca se desaloja.
    pub fn insert(&mut self, key: K, value: V, size: u64) -> Vec<(K, V)> {
        if size > self.capacity_bytes {
            debug!("Entrada de {} bytes excede la capacidad de {}", size, self.capacity_bytes);
            return vec![(key, value)];
        }

        let mut discarded = Vec::new();
        if let Some(previous) = self.remove(&key) {
            discarded.push((key.clone(), previous));
        }

        let tick = self.tick();
        self.total_bytes += size;
        self.entries.insert(
            key.clone(),
            Slot {
                value,
                size,
                last_used: tick,
            },
        );

        while self.total_bytes > self.capacity_bytes {
            let oldest = self
                .entries
                .iter()
                .filter(|(candidate, _)| **candidate != key)
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(candidate, _)| candidate.clone());

            match oldest {
                Some(oldest) => {
                    if let Some(value) = self.remove(&oldest) {
                        discarded.push((oldest, value));
                    }
                }
                None => break,
            }
        }

        discarded
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.total_bytes -= slot.size;
        Some(slot.value)
    }

    /// Vacía el cache devolviendo todas las entradas
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.total_bytes = 0;
        self.entries
            .drain()
            .map(|(key, slot)| (key, slot.value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
