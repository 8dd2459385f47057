//! Read-only lookups against the rest of the studio business. The scheduling
//! core trusts coach and location ids as given; the serving layer uses this
//! seam to pre-validate admin commands before they reach the engine.

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    pub id: Ulid,
    pub name: String,
    /// IANA zone name, consumed by schedule tooling upstream of the engine.
    pub time_zone: String,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// `None` when the coach is unknown.
    async fn coach_active(&self, coach_id: Ulid) -> Option<bool>;

    async fn location(&self, location_id: Ulid) -> Option<LocationInfo>;
}

/// In-memory directory, fed by admin commands.
#[derive(Default)]
pub struct StaticDirectory {
    coaches: DashMap<Ulid, bool>,
    locations: DashMap<Ulid, LocationInfo>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_coach(&self, coach_id: Ulid, active: bool) {
        self.coaches.insert(coach_id, active);
    }

    pub fn upsert_location(&self, info: LocationInfo) {
        self.locations.insert(info.id, info);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn coach_active(&self, coach_id: Ulid) -> Option<bool> {
        self.coaches.get(&coach_id).map(|e| *e.value())
    }

    async fn location(&self, location_id: Ulid) -> Option<LocationInfo> {
        self.locations.get(&location_id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coach_lookup() {
        let dir = StaticDirectory::new();
        let coach = Ulid::new();
        assert_eq!(dir.coach_active(coach).await, None);

        dir.upsert_coach(coach, true);
        assert_eq!(dir.coach_active(coach).await, Some(true));

        dir.upsert_coach(coach, false);
        assert_eq!(dir.coach_active(coach).await, Some(false));
    }

    #[tokio::test]
    async fn location_lookup() {
        let dir = StaticDirectory::new();
        let loc = LocationInfo {
            id: Ulid::new(),
            name: "Downtown".into(),
            time_zone: "America/New_York".into(),
        };
        dir.upsert_location(loc.clone());
        assert_eq!(dir.location(loc.id).await, Some(loc));
        assert_eq!(dir.location(Ulid::new()).await, None);
    }
}
