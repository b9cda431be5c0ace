use crate::agent::AgentError;
use crate::engine::ObjectLookup;

pub fn lookup_object_by_id<L: ObjectLookup>(lookup: &L, id: i64) -> Result<L::Handle, AgentError> {
    let id = u32::try_from(id)
        .ok()
        .filter(|&id| id > 0)
        .ok_or_else(|| AgentError::InvalidArgument("expected positive integer id".to_string()))?;
    lookup.find_object_by_id(id).ok_or_else(|| {
        AgentError::NotFound("no object found, have you taken a snapshot?".to_string())
    })
}

pub fn id_of_object<L: ObjectLookup>(lookup: &L, handle: &L::Handle) -> Result<u32, AgentError> {
    match lookup.object_id(handle) {
        0 => Err(AgentError::NotFound(
            "no snapshots found, take one first".to_string(),
        )),
        id => Ok(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Table(HashMap<u32, &'static str>);

    impl ObjectLookup for Table {
        type Handle = &'static str;

        fn find_object_by_id(&self, id: u32) -> Option<Self::Handle> {
            self.0.get(&id).copied()
        }

        fn object_id(&self, handle: &Self::Handle) -> u32 {
            self.0
                .iter()
                .find(|(_, name)| *name == handle)
                .map(|(&id, _)| id)
                .unwrap_or(0)
        }
    }

    fn table() -> Table {
        Table(HashMap::from([(1, "global"), (7, "cache")]))
    }

    #[test]
    fn rejects_non_positive_ids() {
        for id in [0, -5, i64::MIN] {
            let err = lookup_object_by_id(&table(), id).unwrap_err();
            assert!(matches!(err, AgentError::InvalidArgument(_)), "id {id}");
        }
    }

    #[test]
    fn rejects_ids_beyond_u32() {
        let err = lookup_object_by_id(&table(), i64::from(u32::MAX) + 1).unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let err = lookup_object_by_id(&table(), 2).unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[test]
    fn known_id_resolves_both_ways() {
        let table = table();
        let handle = lookup_object_by_id(&table, 7).unwrap();
        assert_eq!(handle, "cache");
        assert_eq!(id_of_object(&table, &handle).unwrap(), 7);
    }

    #[test]
    fn sentinel_zero_is_not_found() {
        let err = id_of_object(&table(), &"stranger").unwrap_err();
        assert_eq!(err.to_string(), "no snapshots found, take one first");
    }
}
