//! Query templates. Every key or segment reaches the engine as a bound
//! parameter; paths inside recursive queries are `/`-joined segments.

/// `?1` start node id, `?2` `/`-joined key. Yields the start row at depth 0
/// followed by every node matched contiguously along the key.
pub(crate) const WALK_SQL: &str = r"
WITH RECURSIVE
  steps(depth, name, rest) AS (
    SELECT 0, NULL, CASE WHEN ?2 = '' THEN '' ELSE ?2 || '/' END
    UNION ALL
    SELECT depth + 1,
           substr(rest, 1, instr(rest, '/') - 1),
           substr(rest, instr(rest, '/') + 1)
    FROM steps
    WHERE rest <> ''
  ),
  walk(depth, id, pid, name, has_value, value) AS (
    SELECT 0, id, pid, name, has_value, value FROM nodes WHERE id = ?1
    UNION ALL
    SELECT steps.depth, nodes.id, nodes.pid, nodes.name, nodes.has_value, nodes.value
    FROM walk
    JOIN steps ON steps.depth = walk.depth + 1
    JOIN nodes ON nodes.pid = walk.id AND nodes.name = steps.name
  )
SELECT id, pid, name, has_value, value FROM walk ORDER BY depth
";

pub(crate) const CHILDREN_SQL: &str = r"
SELECT id, pid, name, has_value, value FROM nodes WHERE pid = ?1 ORDER BY name
";

/// Insert-or-reuse of a value-less node; returns the id either way.
pub(crate) const INSERT_NODE_SQL: &str = r"
INSERT INTO nodes (pid, name) VALUES (?1, ?2)
ON CONFLICT (pid, name) DO UPDATE SET name = excluded.name
RETURNING id
";

pub(crate) const UPSERT_VALUE_SQL: &str = r"
INSERT INTO nodes (pid, name, has_value, value) VALUES (?1, ?2, 1, ?3)
ON CONFLICT (pid, name) DO UPDATE SET has_value = 1, value = excluded.value
RETURNING id
";

pub(crate) const SET_VALUE_SQL: &str = r"
UPDATE nodes SET has_value = 1, value = ?2 WHERE id = ?1
";

pub(crate) const CLEAR_VALUE_SQL: &str = r"
UPDATE nodes SET has_value = 0, value = NULL WHERE id = ?1
";

/// `?1` subtree root, `?2` shallow flag. Relative paths, parents first.
pub(crate) const ITEMS_SQL: &str = r"
WITH RECURSIVE items(id, path, has_value, value) AS (
  SELECT id, '', has_value, value FROM nodes WHERE id = ?1
  UNION ALL
  SELECT nodes.id,
         CASE WHEN items.path = '' THEN nodes.name ELSE items.path || '/' || nodes.name END,
         nodes.has_value,
         nodes.value
  FROM items
  JOIN nodes ON nodes.pid = items.id
  WHERE NOT (?2 AND items.has_value)
)
SELECT path, value FROM items WHERE has_value ORDER BY path
";

pub(crate) const COUNT_SQL: &str = r"
WITH RECURSIVE subtree(id, has_value) AS (
  SELECT id, has_value FROM nodes WHERE id = ?1
  UNION ALL
  SELECT nodes.id, nodes.has_value FROM subtree JOIN nodes ON nodes.pid = subtree.id
)
SELECT COUNT(*) FROM subtree WHERE has_value
";

/// Deletes every strict descendant of `?1`.
pub(crate) const DELETE_DESCENDANTS_SQL: &str = r"
WITH RECURSIVE subtree(id) AS (
  SELECT id FROM nodes WHERE pid = ?1
  UNION ALL
  SELECT nodes.id FROM subtree JOIN nodes ON nodes.pid = subtree.id
)
DELETE FROM nodes WHERE id IN (SELECT id FROM subtree)
";

pub(crate) const DELETE_NODE_SQL: &str = r"
DELETE FROM nodes WHERE id = ?1
";

/// Removes `?1` only if it carries no value and has no children.
pub(crate) const DELETE_EMPTY_LEAF_SQL: &str = r"
DELETE FROM nodes
WHERE id = ?1
  AND has_value = 0
  AND NOT EXISTS (SELECT 1 FROM nodes AS child WHERE child.pid = ?1)
";

/// `?1` old root (NULL for an empty side), `?2` new root, `?3` include
/// unchanged entries. Emulates a full outer join of both listings by path.
pub(crate) const DIFF_SQL: &str = r"
WITH RECURSIVE
  old_tree(id, path, has_value, value) AS (
    SELECT id, '', has_value, value FROM nodes WHERE id = ?1
    UNION ALL
    SELECT nodes.id,
           CASE WHEN old_tree.path = '' THEN nodes.name ELSE old_tree.path || '/' || nodes.name END,
           nodes.has_value,
           nodes.value
    FROM old_tree
    JOIN nodes ON nodes.pid = old_tree.id
  ),
  new_tree(id, path, has_value, value) AS (
    SELECT id, '', has_value, value FROM nodes WHERE id = ?2
    UNION ALL
    SELECT nodes.id,
           CASE WHEN new_tree.path = '' THEN nodes.name ELSE new_tree.path || '/' || nodes.name END,
           nodes.has_value,
           nodes.value
    FROM new_tree
    JOIN nodes ON nodes.pid = new_tree.id
  ),
  old_items(path, value) AS (
    SELECT path, COALESCE(value, x'') FROM old_tree WHERE has_value
  ),
  new_items(path, value) AS (
    SELECT path, COALESCE(value, x'') FROM new_tree WHERE has_value
  ),
  joined(path, in_old, old_value, in_new, new_value) AS (
    SELECT old_items.path, 1, old_items.value, new_items.path IS NOT NULL, new_items.value
    FROM old_items
    LEFT JOIN new_items ON new_items.path = old_items.path
    UNION ALL
    SELECT new_items.path, 0, NULL, 1, new_items.value
    FROM new_items
    WHERE NOT EXISTS (SELECT 1 FROM old_items WHERE old_items.path = new_items.path)
  )
SELECT path, in_old, old_value, in_new, new_value
FROM joined
WHERE ?3 OR NOT in_old OR NOT in_new OR old_value <> new_value
ORDER BY path
";
