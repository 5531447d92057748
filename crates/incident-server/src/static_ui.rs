pub const UI_HTML: &str = r#"
<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Incident Reports</title>
    <style>
        * {
            margin: 0;
            padding: 0;
            box-sizing: border-box;
        }
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Oxygen, Ubuntu, Cantarell, sans-serif;
            background: linear-gradient(135deg, #f5f7fa 0%, #c3cfe2 100%);
            padding: 20px;
            color: #333;
        }
        .container {
            max-width: 900px;
            margin: 0 auto;
        }
        h1 {
            text-align: center;
            color: #2c3e50;
            margin-bottom: 10px;
            font-size: 2.2em;
        }
        .status {
            text-align: center;
            color: #666;
            margin-bottom: 30px;
        }
        .status-ok { color: #27ae60; }
        .status-warn { color: #f39c12; }
        .status-fail { color: #e74c3c; }
        .incident-card {
            display: flex;
            gap: 20px;
            background: white;
            border-radius: 12px;
            padding: 20px;
            margin-bottom: 20px;
            box-shadow: 0 4px 6px rgba(0,0,0,0.1);
        }
        .incident-card img, .placeholder {
            width: 160px;
            height: 120px;
            object-fit: cover;
            border-radius: 8px;
            flex-shrink: 0;
        }
        .placeholder {
            display: flex;
            align-items: center;
            justify-content: center;
            background: #ecf0f1;
            color: #95a5a6;
            font-size: 0.9em;
        }
        .description {
            font-size: 1.1em;
            margin-bottom: 8px;
        }
        .meta {
            color: #7f8c8d;
            font-size: 0.9em;
            margin-bottom: 4px;
        }
        .meta a {
            color: #2980b9;
        }
        .empty {
            text-align: center;
            color: #7f8c8d;
            padding: 40px;
        }
    </style>
</head>
<body>
    <div class="container">
        <h1>Incident Reports</h1>
        <div class="status" id="status">Loading...</div>
        <div id="incidents"></div>
    </div>

    <script>
        const MONTHS = ['Jan', 'Feb', 'Mar', 'Apr', 'May', 'Jun', 'Jul', 'Aug', 'Sep', 'Oct', 'Nov', 'Dec'];

        function pad(n) {
            return String(n).padStart(2, '0');
        }

        function formatDate(ms) {
            const d = new Date(ms);
            return `${pad(d.getUTCDate())} ${MONTHS[d.getUTCMonth()]}, ${pad(d.getUTCHours())}:${pad(d.getUTCMinutes())}`;
        }

        function escapeHtml(text) {
            const div = document.createElement('div');
            div.textContent = text;
            return div.innerHTML;
        }

        const BASE64 = /^[A-Za-z0-9+\/]*={0,2}$/;
        const PLACEHOLDER = '<div class="placeholder">no evidence</div>';

        function renderPhoto(encoded) {
            const photo = String(encoded || '').replace(/\s/g, '');
            if (photo === '' || !BASE64.test(photo)) {
                return PLACEHOLDER;
            }
            return `<img src="data:image/jpeg;base64,${photo}" alt="evidence" onerror="this.outerHTML=PLACEHOLDER">`;
        }

        function renderIncident(incident) {
            const photo = renderPhoto(incident.fotoUrl);
            const lat = Number(incident.latitud);
            const lon = Number(incident.longitud);
            return `
                <div class="incident-card">
                    ${photo}
                    <div>
                        <div class="description">${escapeHtml(incident.descripcion)}</div>
                        <div class="meta">${formatDate(incident.fecha)} &middot; ${escapeHtml(incident.usuarioEmail)}</div>
                        <div class="meta"><a href="https://maps.google.com/?q=${lat},${lon}" target="_blank">${lat.toFixed(5)}, ${lon.toFixed(5)}</a></div>
                    </div>
                </div>
            `;
        }

        async function fetchIncidents() {
            try {
                const response = await fetch('/incidents');
                const incidents = await response.json();
                const container = document.getElementById('incidents');
                if (incidents.length === 0) {
                    container.innerHTML = '<div class="empty">No incidents reported yet</div>';
                } else {
                    container.innerHTML = incidents.map(renderIncident).join('');
                }
            } catch (error) {
                console.error('Error fetching incidents:', error);
            }
        }

        async function fetchHealth() {
            try {
                const response = await fetch('/health');
                const health = await response.json();
                const status = document.getElementById('status');
                status.className = 'status status-' + health.status.toLowerCase();
                status.textContent = `${health.status} · ${health.incidents} incidents · ${health.ws_sessions} clients`;
            } catch (error) {
                console.error('Error fetching health:', error);
            }
        }

        fetchIncidents();
        fetchHealth();
        setInterval(fetchIncidents, 2000);
        setInterval(fetchHealth, 5000);
    </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_checked_before_markup() {
        assert!(UI_HTML.contains("BASE64.test(photo)"));
        assert!(!UI_HTML.contains("${incident.fotoUrl"));
        assert!(UI_HTML.contains("escapeHtml(incident.descripcion)"));
        assert!(UI_HTML.contains("escapeHtml(incident.usuarioEmail)"));
    }
}
