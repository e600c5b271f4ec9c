use pkg_state::Api;
use pkg_types::Resource;
use tracing::debug;

/// Applies `mutate` and writes the object back.
///
/// `mutate` returns whether it changed anything; an unchanged object is not
/// written. A conflict re-fetches the object and retries once, a second
/// conflict is returned. `Ok(None)` means the object no longer exists.
pub async fn update_with_retry<K, F>(api: &Api<K>, obj: K, mutate: F) -> anyhow::Result<Option<K>>
where
    K: Resource,
    F: Fn(&mut K) -> bool,
{
    let namespace = obj.namespace().to_string();
    let name = obj.name().to_string();
    let mut current = obj;
    let mut retried = false;
    loop {
        if !mutate(&mut current) {
            return Ok(Some(current));
        }
        match api.update(&current).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) if e.is_conflict() && !retried => {
                debug!("Conflict updating {} {}, retrying once", K::KIND, current.meta().key());
                retried = true;
                match api.get_opt(&namespace, &name).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(None),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}
