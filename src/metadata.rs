use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::convert::ConvertedUpload;
use crate::domain::Project;
use crate::error::VaultError;
use crate::store::Store;

/// Converter output entry point the viewer loads.
pub const ARTIFACT_ENTRY: &str = "metadata.json";

#[derive(Debug, Clone)]
pub struct MetadataWriter {
    store: Store,
    url_prefix: String,
}

impl MetadataWriter {
    pub fn new(store: Store, url_prefix: String) -> Self {
        Self { store, url_prefix }
    }

    /// Publishes a converted project. The descriptor is written last: until it
    /// lands the project stays invisible to listings and accounting.
    ///
    /// Never creates the project directory. If it was deleted or swept while
    /// the converter ran, publishing fails with `ProjectNotFound`.
    pub fn publish(
        &self,
        upload: &ConvertedUpload,
        uploaded_at: DateTime<Utc>,
    ) -> Result<Project, VaultError> {
        let project = Project::new(
            upload.project_id.clone(),
            upload.owner_id.clone(),
            upload.original_name.clone(),
            upload.byte_size,
            uploaded_at,
            &self.url_prefix,
        );

        if !upload.artifact_dir.as_std_path().is_dir() {
            warn!(project_id = %project.id, "project removed before it could be published");
            return Err(VaultError::ProjectNotFound(project.id.to_string()));
        }

        let viewer = render_viewer(&project);
        Store::replace_file(&self.store.viewer_path(&project.id), viewer.as_bytes())?;
        self.store.write_descriptor(&project)?;

        info!(
            project_id = %project.id,
            owner_id = %project.owner_id,
            bytes = project.byte_size,
            "project published"
        );
        Ok(project)
    }
}

/// Static viewer page pointing at the converted artifact.
pub fn render_viewer(project: &Project) -> String {
    let title = escape_html(&project.original_name);
    let entry = escape_html(&format!("{}{ARTIFACT_ENTRY}", project.artifact_root_url));
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>{title}</title>
    <link rel="stylesheet" type="text/css" href="/potree/build/potree/potree.css">
</head>
<body>
    <script src="/potree/libs/jquery/jquery-3.1.1.min.js"></script>
    <script src="/potree/libs/other/BinaryHeap.js"></script>
    <script src="/potree/libs/tween/tween.min.js"></script>
    <script src="/potree/libs/proj4/proj4.js"></script>
    <script src="/potree/build/potree/potree.js"></script>

    <div class="potree_container" style="position: absolute; width: 100%; height: 100%; left: 0px; top: 0px;">
        <div id="potree_render_area" data-entry="{entry}" data-title="{title}"></div>
        <div id="potree_sidebar_container"></div>
    </div>

    <script>
        const area = document.getElementById("potree_render_area");
        window.viewer = new Potree.Viewer(area);
        viewer.setFOV(60);
        viewer.setPointBudget(5 * 1000 * 1000);
        viewer.loadGUI();
        Potree.loadPointCloud(area.dataset.entry, area.dataset.title, e => {{
            viewer.scene.addPointCloud(e.pointcloud);
            viewer.fitToScreen();
        }});
    </script>
</body>
</html>
"#
    )
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
