use rand::seq::IteratorRandom;
use serenity::model::id::UserId;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::track::{EntryKey, QueueEntry, Track};

/// Mayor índice aceptado de un snapshot; deja margen para seguir asignando
const MAX_RESTORED_INDEX: u64 = i64::MAX as u64;

/// Colección ordenada de pistas de un guild.
///
/// Cada entrada tiene una clave única y un índice que sólo crece: borrar
/// entradas nunca libera índices, así que el orden por índice es estable.
#[derive(Debug, Default)]
pub struct TrackCollection {
    entries: HashMap<EntryKey, QueueEntry>,
    order: BTreeMap<u64, EntryKey>,
    next_index: u64,
}

impl TrackCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agrega una pista al final y devuelve su clave
    pub fn add(&mut self, track: Track, requester: UserId) -> EntryKey {
        let key = EntryKey::generate();
        let index = self.take_index();

        info!("➕ Agregado a la cola: {} (#{})", track.title, index);
        self.insert(QueueEntry {
            key: key.clone(),
            index,
            track,
            requester,
        });
        key
    }

    /// Reinsertar una entrada persistida conservando su índice original.
    ///
    /// Devuelve `false` si la clave ya existía; la entrada original se conserva.
    pub fn restore(&mut self, key: EntryKey, index: u64, track: Track, requester: UserId) -> bool {
        if self.entries.contains_key(&key) {
            warn!("♻️ Entrada {} ya restaurada, se ignora el duplicado", key);
            return false;
        }
        if self.order.contains_key(&index) {
            warn!("♻️ Índice {} ya ocupado, se ignora la entrada {}", index, key);
            return false;
        }
        if index > MAX_RESTORED_INDEX {
            warn!("♻️ Índice {} fuera de rango, se ignora la entrada {}", index, key);
            return false;
        }

        self.next_index = self.next_index.max(index + 1);
        self.insert(QueueEntry {
            key,
            index,
            track,
            requester,
        });
        true
    }

    /// Mueve una entrada al final asignándole un índice nuevo (rotación de loop de cola)
    pub fn requeue(&mut self, key: &EntryKey) -> Option<u64> {
        let old_index = self.entries.get(key)?.index;
        let new_index = self.take_index();

        self.order.remove(&old_index);
        self.order.insert(new_index, key.clone());
        if let Some(entry) = self.entries.get_mut(key) {
            entry.index = new_index;
        }

        debug!("🔁 Entrada {} rotada de #{} a #{}", key, old_index, new_index);
        Some(new_index)
    }

    pub fn delete(&mut self, key: &EntryKey) -> Option<QueueEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.index);
        debug!("❌ Entrada eliminada: {} (#{})", entry.track.title, entry.index);
        Some(entry)
    }

    pub fn delete_first_by_index(&mut self) -> Option<QueueEntry> {
        let key = self.order.values().next()?.clone();
        self.delete(&key)
    }

    pub fn get(&self, key: &EntryKey) -> Option<&QueueEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn sorted_by_index(&self) -> Vec<&QueueEntry> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key))
            .collect()
    }

    pub fn random(&self) -> Option<&QueueEntry> {
        self.entries.values().choose(&mut rand::thread_rng())
    }

    /// Entrada aleatoria distinta de `exclude` cuando hay alternativas
    pub fn random_except(&self, exclude: &EntryKey) -> Option<&QueueEntry> {
        let mut rng = rand::thread_rng();
        self.entries
            .values()
            .filter(|entry| &entry.key != exclude)
            .choose(&mut rng)
            .or_else(|| self.entries.get(exclude))
    }

    pub fn filter<P>(&self, mut predicate: P) -> Vec<&QueueEntry>
    where
        P: FnMut(&QueueEntry) -> bool,
    {
        self.sorted_by_index()
            .into_iter()
            .filter(|entry| predicate(entry))
            .collect()
    }

    pub fn first(&self) -> Option<&QueueEntry> {
        self.order.values().next().and_then(|key| self.entries.get(key))
    }

    /// Primera entrada con índice estrictamente mayor que `index`
    pub fn next_after(&self, index: u64) -> Option<&QueueEntry> {
        self.order
            .range(index.checked_add(1)?..)
            .next()
            .and_then(|(_, key)| self.entries.get(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Suma de duraciones conocidas, en segundos
    pub fn total_duration(&self) -> u64 {
        self.entries.values().map(|entry| entry.track.duration).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        info!("🗑️ Cola limpiada");
    }

    // Funciones privadas

    fn take_index(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn insert(&mut self, entry: QueueEntry) {
        self.order.insert(entry.index, entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
    }
}
